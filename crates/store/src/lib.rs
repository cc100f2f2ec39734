//! The local slice of the ring's key/value space: a TTL-bounded,
//! integrity-checked cache persisted to a single directory.
//!
//! Every entry carries an HMAC-SHA256 tag computed over its value with a
//! process-wide secret. Readers verify the tag and treat any mismatch as
//! absence; tampered entries are left in place to lapse at their expiry.
//! The directory is the durable copy (one JSON document per key) and an
//! in-memory index tracks keys and deadlines, so reads observe on-disk
//! edits and restarts recover the cache.

use hmac::{Hmac, Mac};
use ring_id::{between, Ring};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Default lifetime of a stored entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open cache directory {dir}")]
    Open {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The durable form of one entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Entry {
    value: String,
    mac: String,
    expires_at: u64,
}

/// A key-addressed cache rooted at one directory.
///
/// `Store` holds the ring capability (identifier width and the arc
/// predicate) rather than a node handle, so it can judge key ownership
/// without a back-reference to routing state.
pub struct Store {
    dir: PathBuf,
    secret: Vec<u8>,
    ring: Ring,
    // Keys currently present, with their deadlines. Values live on disk.
    index: Mutex<HashMap<String, u64>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

impl Store {
    /// Open (creating if needed) the cache directory and index the
    /// entries already present. Unreadable documents are skipped with a
    /// warning; expired ones are dropped silently.
    ///
    /// `secret` keys the per-entry MACs. When it is derived from the
    /// node's own id this provides single-node integrity only, not
    /// inter-node authentication.
    pub fn open(dir: impl AsRef<Path>, secret: &str, ring: Ring) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| Error::Open {
            dir: dir.clone(),
            source,
        })?;

        let mut index = HashMap::new();
        let now = now_secs();
        let entries = std::fs::read_dir(&dir).map_err(|source| Error::Open {
            dir: dir.clone(),
            source,
        })?;
        for dirent in entries.flatten() {
            let path = dirent.path();
            let Some(key) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<Entry>(&text).ok())
            {
                Some(entry) if entry.expires_at > now => {
                    index.insert(key.to_string(), entry.expires_at);
                }
                Some(_) => (), // Lapsed while we were down.
                None => {
                    tracing::warn!(key, path = %path.display(), "skipping unreadable cache entry");
                }
            }
        }
        tracing::debug!(dir = %dir.display(), entries = index.len(), "opened cache");

        Ok(Self {
            dir,
            secret: secret.as_bytes().to_vec(),
            ring,
            index: Mutex::new(index),
        })
    }

    fn mac(&self, value: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn path_of(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read and verify one entry from disk. `None` uniformly covers
    /// absent, expired, unreadable, and tampered entries. Tampered
    /// documents are not deleted; they expire on their own schedule.
    fn load_verified(&self, key: &str, now: u64) -> Option<String> {
        let text = std::fs::read_to_string(self.path_of(key)).ok()?;
        let entry: Entry = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(error) => {
                tracing::warn!(key, %error, "discarding undecodable cache entry");
                return None;
            }
        };
        if entry.expires_at <= now {
            return None;
        }
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(entry.value.as_bytes());
        let tag = hex::decode(&entry.mac).unwrap_or_default();
        if mac.verify_slice(&tag).is_err() {
            tracing::warn!(key, "cache entry failed integrity check");
            return None;
        }
        Some(entry.value)
    }

    /// Store `value` under `key` for `ttl`. Returns false when the entry
    /// could not be made durable; callers may retry elsewhere.
    pub fn put(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let entry = Entry {
            value: value.to_string(),
            mac: self.mac(value),
            expires_at: now_secs() + ttl.as_secs(),
        };
        let doc = serde_json::to_string(&entry).expect("entry serialization is infallible");

        let mut index = self.index.lock().unwrap();
        if let Err(error) = std::fs::write(self.path_of(key), doc) {
            tracing::warn!(key, %error, "failed to persist cache entry");
            return false;
        }
        index.insert(key.to_string(), entry.expires_at);
        true
    }

    /// Bulk load, used when taking over keys from a neighbor.
    pub fn put_many<I>(&self, pairs: I, ttl: Duration) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        pairs
            .into_iter()
            .filter(|(key, value)| self.put(key, value, ttl))
            .count()
    }

    /// Fetch `key` iff present, unexpired, and authentic.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = now_secs();
        {
            let index = self.index.lock().unwrap();
            match index.get(key) {
                Some(&deadline) if deadline > now => (),
                _ => return None,
            }
        }
        self.load_verified(key, now)
    }

    pub fn delete(&self, key: &str) {
        let mut index = self.index.lock().unwrap();
        index.remove(key);
        let _ = std::fs::remove_file(self.path_of(key));
    }

    pub fn delete_many<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut index = self.index.lock().unwrap();
        for key in keys {
            index.remove(key);
            let _ = std::fs::remove_file(self.path_of(key));
        }
    }

    /// Snapshot of every live, authentic entry.
    pub fn iter_mine(&self) -> Vec<(String, String)> {
        let now = now_secs();
        let keys: Vec<String> = {
            let index = self.index.lock().unwrap();
            index
                .iter()
                .filter(|(_, &deadline)| deadline > now)
                .map(|(key, _)| key.clone())
                .collect()
        };
        keys.into_iter()
            .filter_map(|key| self.load_verified(&key, now).map(|value| (key, value)))
            .collect()
    }

    /// Entries whose numeric key lies in the open arc `(left, right)`.
    pub fn iter_range(&self, left: u64, right: u64) -> Vec<(String, String)> {
        let size = self.ring.size();
        self.iter_mine()
            .into_iter()
            .filter(|(key, _)| match self.ring.numeric(key) {
                Ok(numeric) => between(numeric, left, right, false, false, size),
                Err(_) => false,
            })
            .collect()
    }

    /// Atomically remove and return every live, authentic entry. The
    /// caller is responsible for re-persisting whatever must survive;
    /// this is the worker's claim step. The index lock is held across
    /// the file reads and deletions, so a concurrent `put` of a claimed
    /// key lands either before the drain (and is drained) or after it
    /// (and survives). Entries that fail verification are logged and
    /// left on disk to lapse at their expiry.
    pub fn drain_jobs(&self) -> Vec<(String, String)> {
        let now = now_secs();
        let mut index = self.index.lock().unwrap();
        let claimed = std::mem::take(&mut *index);
        let mut drained = Vec::with_capacity(claimed.len());
        for (key, deadline) in claimed {
            if deadline <= now {
                continue;
            }
            if let Some(value) = self.load_verified(&key, now) {
                let _ = std::fs::remove_file(self.path_of(&key));
                drained.push((key, value));
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        let now = now_secs();
        let index = self.index.lock().unwrap();
        index.values().filter(|&&deadline| deadline > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_temp(secret: &str) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), secret, Ring::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn round_trips_values() {
        let (_dir, store) = open_temp("s3cret");
        assert!(store.put("00ff", "a value", DEFAULT_TTL));
        assert_eq!(store.get("00ff").as_deref(), Some("a value"));
        assert_eq!(store.get("0100"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let (_dir, store) = open_temp("s3cret");
        assert!(store.put("00ff", "short-lived", Duration::ZERO));
        assert_eq!(store.get("00ff"), None);
        assert!(store.iter_mine().is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn tampered_value_reads_as_absent() {
        let (dir, store) = open_temp("s3cret");
        assert!(store.put("00ff", "authentic", DEFAULT_TTL));

        // Flip a byte of the stored value behind the store's back.
        let path = dir.path().join("00ff.json");
        let doc = std::fs::read_to_string(&path).unwrap();
        let tampered = doc.replace("authentic", "synthetic");
        assert_ne!(doc, tampered);
        std::fs::write(&path, tampered).unwrap();

        assert_eq!(store.get("00ff"), None);
        // The tampered document is preserved for inspection.
        assert!(path.exists());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "s3cret", Ring::default()).unwrap();
            assert!(store.put("00ff", "durable", DEFAULT_TTL));
        }
        let store = Store::open(dir.path(), "s3cret", Ring::default()).unwrap();
        assert_eq!(store.get("00ff").as_deref(), Some("durable"));
    }

    #[test]
    fn reopen_with_other_secret_rejects() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "first", Ring::default()).unwrap();
            assert!(store.put("00ff", "sealed", DEFAULT_TTL));
        }
        let store = Store::open(dir.path(), "second", Ring::default()).unwrap();
        assert_eq!(store.get("00ff"), None);
    }

    #[test]
    fn iter_range_is_open_arc() {
        let (_dir, store) = open_temp("s3cret");
        for key in ["0001", "0005", "000a", "fffe"] {
            assert!(store.put(key, key, DEFAULT_TTL));
        }

        let mut keys: Vec<String> = store
            .iter_range(0x0001, 0x000a)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["0005"]);

        // Wrapping arc picks up the high key.
        let mut keys: Vec<String> = store
            .iter_range(0x000a, 0x0001)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["fffe"]);
    }

    #[test]
    fn drain_claims_everything_once() {
        let (_dir, store) = open_temp("s3cret");
        assert!(store.put("0001", "one", DEFAULT_TTL));
        assert!(store.put("0002", "two", DEFAULT_TTL));

        let mut drained = store.drain_jobs();
        drained.sort();
        assert_eq!(
            drained,
            vec![
                ("0001".to_string(), "one".to_string()),
                ("0002".to_string(), "two".to_string()),
            ]
        );
        assert!(store.drain_jobs().is_empty());
        assert_eq!(store.get("0001"), None);

        // Re-persisting after a drain restores visibility.
        assert!(store.put("0001", "one", DEFAULT_TTL));
        assert_eq!(store.get("0001").as_deref(), Some("one"));
    }

    #[test]
    fn drain_leaves_tampered_entries_on_disk() {
        let (dir, store) = open_temp("s3cret");
        assert!(store.put("0001", "authentic", DEFAULT_TTL));
        assert!(store.put("0002", "tampered", DEFAULT_TTL));

        let path = dir.path().join("0002.json");
        let doc = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, doc.replace("tampered", "replaced")).unwrap();

        let drained = store.drain_jobs();
        assert_eq!(
            drained,
            vec![("0001".to_string(), "authentic".to_string())]
        );

        // The tampered document stays behind for inspection; the
        // drained one is gone.
        assert!(path.exists());
        assert!(!dir.path().join("0001.json").exists());
    }

    #[test]
    fn delete_many_removes_files() {
        let (dir, store) = open_temp("s3cret");
        assert!(store.put("0001", "one", DEFAULT_TTL));
        assert!(store.put("0002", "two", DEFAULT_TTL));
        store.delete_many(["0001", "0002"]);
        assert!(store.is_empty());
        assert!(!dir.path().join("0001.json").exists());
    }

    #[test]
    fn put_many_counts_successes() {
        let (_dir, store) = open_temp("s3cret");
        let loaded = store.put_many(
            vec![
                ("0001".to_string(), "one".to_string()),
                ("0002".to_string(), "two".to_string()),
            ],
            DEFAULT_TTL,
        );
        assert_eq!(loaded, 2);
        assert_eq!(store.len(), 2);
    }
}
