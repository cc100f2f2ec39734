use crate::JOB_TTL;
use anyhow::Context;
use ring_id::{between, NodeRecord, Ring};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::Store;

/// Tunables of the membership and lookup protocol.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hop budget for one successor lookup.
    pub max_steps: u32,
    /// Length of the successor list kept for failover.
    pub successor_count: usize,
    /// Replica copies beyond the primary.
    pub replicas: u64,
    /// Cadence of the maintenance loops and the worker.
    pub interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_steps: 8,
            successor_count: 6,
            replicas: 1,
            interval: Duration::from_secs(1),
        }
    }
}

/// Routing state, guarded as one unit. Mutated only by the maintenance
/// loops, `notify`, and the successor-failure fallback; every reader
/// takes a snapshot and the lock is never held across an RPC.
struct RingState {
    predecessor: Option<NodeRecord>,
    successor: NodeRecord,
    successors: Vec<NodeRecord>,
    fingers: Vec<NodeRecord>,
    next_finger: usize,
}

/// One member of the ring.
pub struct Node {
    ring: Ring,
    me: NodeRecord,
    config: Config,
    state: Mutex<RingState>,
    store: Store,
    client: rpc::Client,
}

impl Node {
    /// A node starts as a singleton: predecessor unset, successor list
    /// and every finger pointing at itself. `join` then splices it into
    /// an existing ring.
    pub fn new(addr: &str, ring: Ring, store: Store, client: rpc::Client, config: Config) -> Arc<Self> {
        let me = NodeRecord::from_addr(&ring, addr);
        let state = RingState {
            predecessor: None,
            successor: me.clone(),
            successors: vec![me.clone(); config.successor_count],
            fingers: vec![me.clone(); ring.bits() as usize],
            next_finger: 0,
        };
        Arc::new(Self {
            ring,
            me,
            config,
            state: Mutex::new(state),
            store,
            client,
        })
    }

    pub fn me(&self) -> &NodeRecord {
        &self.me
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn predecessor(&self) -> Option<NodeRecord> {
        self.state.lock().unwrap().predecessor.clone()
    }

    pub fn successor(&self) -> NodeRecord {
        self.state.lock().unwrap().successor.clone()
    }

    pub fn successors(&self) -> Vec<NodeRecord> {
        self.state.lock().unwrap().successors.clone()
    }

    pub fn fingers(&self) -> Vec<NodeRecord> {
        self.state.lock().unwrap().fingers.clone()
    }

    /// Splice into the ring through `bootstrap`, or stand alone when no
    /// bootstrap is given. Joining resolves our successor through the
    /// bootstrap peer and eagerly takes over the keys that now fall in
    /// our arc, so reads of migrated keys never have to double back.
    pub async fn join(&self, bootstrap: Option<&str>) -> anyhow::Result<()> {
        let Some(bootstrap) = bootstrap.filter(|addr| *addr != self.me.addr) else {
            tracing::info!(me = %self.me, "starting a new ring");
            return Ok(());
        };

        let (found, successor) = self
            .client
            .find_successor(bootstrap, self.me.numeric_id)
            .await;
        let successor = successor
            .filter(|_| found)
            .with_context(|| format!("bootstrap node {bootstrap} could not resolve a successor"))?;
        tracing::info!(me = %self.me, successor = %successor, "joining ring");

        {
            let mut state = self.state.lock().unwrap();
            state.successor = successor.clone();
            state.successors = vec![successor.clone(); self.config.successor_count];
            for finger in state.fingers.iter_mut() {
                *finger = successor.clone();
            }
        }

        // The successor hands over (and forgets) every key that is ours.
        if let Some((keys, values)) = self
            .client
            .get_all(&successor.addr, self.me.numeric_id)
            .await
        {
            let taken = self
                .store
                .put_many(keys.into_iter().zip(values), JOB_TTL);
            if taken > 0 {
                tracing::info!(keys = taken, from = %successor.addr, "took over keys from successor");
            }
        }
        Ok(())
    }

    /// The purely local routing decision: answer when the id falls in
    /// `(self, successor]`, otherwise hand back the best finger to ask.
    fn local_find_successor(&self, numeric_id: u64) -> (bool, NodeRecord) {
        let state = self.state.lock().unwrap();
        if between(
            numeric_id,
            self.me.numeric_id,
            state.successor.numeric_id,
            false,
            true,
            self.ring.size(),
        ) {
            return (true, state.successor.clone());
        }
        (false, self.closest_preceding(&state, numeric_id))
    }

    /// Highest finger strictly between us and the target, falling back
    /// to the successor.
    fn closest_preceding(&self, state: &RingState, numeric_id: u64) -> NodeRecord {
        for finger in state.fingers.iter().rev() {
            if between(
                finger.numeric_id,
                self.me.numeric_id,
                numeric_id,
                false,
                false,
                self.ring.size(),
            ) {
                return finger.clone();
            }
        }
        state.successor.clone()
    }

    /// Resolve the node owning `numeric_id`, following routing hints for
    /// at most `max_steps` hops. `None` means the budget ran out or a
    /// hint was unreachable; during instability that is indistinguishable
    /// from a routing hole and callers treat it as not-found.
    pub async fn find_successor(&self, numeric_id: u64) -> Option<NodeRecord> {
        let (mut found, mut next) = self.local_find_successor(numeric_id);
        let mut steps = 0;
        while !found && steps < self.config.max_steps {
            let (hop_found, hop_next) = self.client.find_successor(&next.addr, numeric_id).await;
            match hop_next {
                Some(node) => {
                    found = hop_found;
                    next = node;
                }
                None => return None,
            }
            steps += 1;
        }
        found.then_some(next)
    }

    /// Ask the successor for its view, adopt better neighbors, refresh
    /// the successor list and fingers, and announce ourselves. On an
    /// unresponsive successor, fail over to the next list entry.
    #[tracing::instrument(level = "debug", skip(self), fields(me = %self.me.addr))]
    pub async fn stabilize_once(&self) {
        let successor = self.successor();
        let (pred, succ_list) = self.client.get_pred_and_succlist(&successor.addr).await;

        // A live peer always reports at least itself; an empty list is
        // the transport's neutral value for an unreachable successor.
        if succ_list.is_empty() {
            tracing::debug!(successor = %successor, "successor unresponsive, failing over");
            self.drop_successor();
            return;
        }

        if let Some(pred) = pred {
            let mut state = self.state.lock().unwrap();
            if between(
                pred.numeric_id,
                self.me.numeric_id,
                state.successor.numeric_id,
                false,
                false,
                self.ring.size(),
            ) {
                tracing::debug!(successor = %pred, "adopting successor's predecessor");
                state.successor = pred.clone();
                state.fingers[0] = pred.clone();
            }
            let adopt = match &state.predecessor {
                None => true,
                Some(current) => between(
                    pred.numeric_id,
                    current.numeric_id,
                    self.me.numeric_id,
                    false,
                    false,
                    self.ring.size(),
                ),
            };
            if adopt && pred.addr != self.me.addr {
                state.predecessor = Some(pred.clone());
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            let head = state.successor.clone();
            let mut list = vec![head];
            list.extend(
                succ_list
                    .into_iter()
                    .take(self.config.successor_count - 1),
            );
            while list.len() < self.config.successor_count {
                let tail = list.last().expect("list starts non-empty").clone();
                list.push(tail);
            }
            state.successors = list;
        }

        // Bulk finger refresh; fix_fingers smooths single entries
        // between these passes.
        for i in 0..self.ring.bits() {
            let target = self.ring.finger_target(self.me.numeric_id, i);
            if let Some(node) = self.find_successor(target).await {
                let mut state = self.state.lock().unwrap();
                if state.fingers[i as usize] != node {
                    state.fingers[i as usize] = node;
                }
            }
        }

        let successor = self.successor();
        self.client.notify(&successor.addr, self.me.clone()).await;
    }

    /// Drop a dead successor and promote the next list entry, falling
    /// back to ourselves when the list is exhausted.
    fn drop_successor(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.successors.is_empty() {
            state.successors.remove(0);
        }
        // Entries equal to the dead head are stale copies of it.
        let dead = state.successor.clone();
        state.successors.retain(|node| node.addr != dead.addr);
        if state.successors.is_empty() {
            state.successors.push(self.me.clone());
        }
        state.successor = state.successors[0].clone();
        state.fingers[0] = state.successor.clone();
        tracing::info!(successor = %state.successor, "promoted new successor");
    }

    /// Refresh one finger per tick, round-robin.
    pub async fn fix_fingers_once(&self) {
        let (index, target) = {
            let mut state = self.state.lock().unwrap();
            state.next_finger = (state.next_finger + 1) % self.ring.bits() as usize;
            (
                state.next_finger,
                self.ring
                    .finger_target(self.me.numeric_id, state.next_finger as u32),
            )
        };
        if let Some(node) = self.find_successor(target).await {
            let mut state = self.state.lock().unwrap();
            if state.fingers[index] != node {
                tracing::debug!(index, finger = %node, "finger updated");
                state.fingers[index] = node;
            }
        }
    }

    /// Clear the predecessor when it stops answering; some neighbor's
    /// stabilize will repopulate it.
    pub async fn check_predecessor_once(&self) {
        let Some(predecessor) = self.predecessor() else {
            return;
        };
        if self.client.ping(&predecessor.addr).await {
            return;
        }
        tracing::info!(predecessor = %predecessor, "predecessor stopped answering");
        let mut state = self.state.lock().unwrap();
        if state
            .predecessor
            .as_ref()
            .is_some_and(|current| current.addr == predecessor.addr)
        {
            state.predecessor = None;
        }
    }

    /// Liveness repair of the successor list tail; stabilize rebuilds
    /// the list from the successor's view each tick, this only weeds out
    /// entries that died in between.
    pub async fn fix_successor_list_once(&self) {
        let list = self.successors();
        for (index, entry) in list.iter().enumerate().skip(1) {
            if entry.addr == self.me.addr || entry.addr == list[0].addr {
                continue;
            }
            if self.client.ping(&entry.addr).await {
                continue;
            }
            let mut state = self.state.lock().unwrap();
            if state
                .successors
                .get(index)
                .is_some_and(|current| current.addr == entry.addr)
            {
                let replacement = state.successor.clone();
                state.successors[index] = replacement;
            }
        }
    }

    /// A peer believes it is our predecessor; adopt it when it sits
    /// strictly between the current predecessor and us.
    pub fn notify(&self, caller: NodeRecord) {
        if caller.addr == self.me.addr {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let adopt = match &state.predecessor {
            None => true,
            Some(current) => between(
                caller.numeric_id,
                current.numeric_id,
                self.me.numeric_id,
                false,
                false,
                self.ring.size(),
            ),
        };
        if adopt {
            tracing::info!(predecessor = %caller, "new predecessor");
            state.predecessor = Some(caller);
        }
    }

    pub fn pred_and_succlist(&self) -> (Option<NodeRecord>, Vec<NodeRecord>) {
        let state = self.state.lock().unwrap();
        (state.predecessor.clone(), state.successors.clone())
    }

    /// Join-time handoff, server side: hand over (and delete) every key
    /// in `(predecessor, node_id]` when `node_id` is a valid joiner in
    /// our arc. A singleton owns the whole circle, so an unset
    /// predecessor is treated as ourselves.
    pub fn get_all(&self, node_id: u64) -> (Vec<String>, Vec<String>) {
        let predecessor = self
            .predecessor()
            .unwrap_or_else(|| self.me.clone());
        if !between(
            node_id,
            predecessor.numeric_id,
            self.me.numeric_id,
            false,
            false,
            self.ring.size(),
        ) {
            return (Vec::new(), Vec::new());
        }

        let handover: Vec<(String, String)> = self
            .store
            .iter_mine()
            .into_iter()
            .filter(|(key, _)| match self.ring.numeric(key) {
                Ok(numeric) => between(
                    numeric,
                    predecessor.numeric_id,
                    node_id,
                    false,
                    true,
                    self.ring.size(),
                ),
                Err(_) => false,
            })
            .collect();
        self.store
            .delete_many(handover.iter().map(|(key, _)| key.as_str()));

        tracing::info!(keys = handover.len(), joiner = node_id, "handed keys to joiner");
        handover.into_iter().unzip()
    }

    /// Write `value` to the primary owner of `key` and its replica
    /// positions. Failed positions are skipped, not fatal: one durable
    /// copy is the write's promise, full replication is repaired by the
    /// next writer or accepted as best-effort under churn.
    pub async fn put_key(&self, key: &str, value: &str, ttl: Duration) -> Vec<String> {
        let numeric = match self.ring.numeric(key) {
            Ok(numeric) => numeric,
            Err(error) => {
                tracing::warn!(key, %error, "refusing to place unparsable key");
                return Vec::new();
            }
        };

        let mut written = Vec::new();
        for replica in 0..=self.config.replicas {
            let target = (numeric + replica) % self.ring.size();
            let Some(owner) = self.find_successor(target).await else {
                tracing::warn!(key, target, "no owner resolved for replica position");
                continue;
            };
            let ok = if owner.addr == self.me.addr {
                self.store.put(key, value, ttl)
            } else {
                self.client
                    .save_key(&owner.addr, key, value, ttl)
                    .await
                    .unwrap_or(false)
            };
            if ok {
                written.push(key.to_string());
            } else {
                tracing::warn!(key, owner = %owner, "replica write failed");
            }
        }
        written
    }

    /// Locate `key`: locally first, then through the responsible node,
    /// then (unless this is already a replica probe) through the replica
    /// positions. `ttl` is the hop budget.
    pub async fn find_key(&self, key: &str, ttl: u32, is_replica: bool) -> Option<String> {
        if ttl == 0 {
            return None;
        }
        let numeric = self.ring.numeric(key).ok()?;
        let attempts = if is_replica { 1 } else { self.config.replicas + 1 };

        for position in 0..attempts {
            if let Some(value) = self.store.get(key) {
                return Some(value);
            }
            let target = (numeric + position) % self.ring.size();
            let Some(owner) = self.find_successor(target).await else {
                continue;
            };
            if owner.addr == self.me.addr {
                // We are the responsible node and just checked locally.
                continue;
            }
            if let Some(value) = self
                .client
                .find_key(&owner.addr, key, ttl - 1, position > 0)
                .await
            {
                return Some(value);
            }
        }
        None
    }

    /// Locate a job by its content hash. The DHT key is the hash
    /// truncated to the ring's key width.
    pub async fn find_job(&self, job_hash: &str, ttl: u32, is_replica: bool) -> Option<String> {
        if job_hash.len() < self.ring.key_len() {
            return None;
        }
        let key = &job_hash[..self.ring.key_len()];
        self.find_key(key, ttl, is_replica).await
    }
}

#[async_trait::async_trait]
impl rpc::Handler for Node {
    #[tracing::instrument(level = "trace", skip(self, request), fields(me = %self.me.addr))]
    async fn handle(&self, request: rpc::Request) -> rpc::Response {
        use rpc::{Request, Response};
        match request {
            Request::Ping => Response::Pong,
            Request::FindSuccessor { numeric_id } => {
                let node = self.find_successor(numeric_id).await;
                Response::Successor {
                    found: node.is_some(),
                    node,
                }
            }
            Request::GetPredAndSucclist => {
                let (predecessor, successors) = self.pred_and_succlist();
                Response::PredAndSucclist {
                    predecessor,
                    successors,
                }
            }
            Request::Notify { node } => {
                self.notify(node);
                Response::Notified
            }
            Request::SaveKey {
                key,
                value,
                ttl_secs,
            } => Response::Saved {
                ok: self
                    .store
                    .put(&key, &value, Duration::from_secs(ttl_secs)),
            },
            Request::PutKey {
                key,
                value,
                ttl_secs,
            } => Response::Put {
                keys: self
                    .put_key(&key, &value, Duration::from_secs(ttl_secs))
                    .await,
            },
            Request::FindKey {
                key,
                ttl,
                is_replica,
            } => Response::Value {
                value: self.find_key(&key, ttl, is_replica).await,
            },
            Request::FindJob {
                job_hash,
                ttl,
                is_replica,
            } => Response::Value {
                value: self.find_job(&job_hash, ttl, is_replica).await,
            },
            Request::GetAll { node_id } => {
                let (keys, values) = self.get_all(node_id);
                Response::All { keys, values }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::HOP_TTL;

    fn test_node(addr: &str) -> (tempfile::TempDir, Arc<Node>) {
        let dir = tempfile::tempdir().unwrap();
        let ring = Ring::default();
        let store = Store::open(dir.path(), "test-secret", ring).unwrap();
        let node = Node::new(addr, ring, store, rpc::Client::default(), Config::default());
        (dir, node)
    }

    #[tokio::test]
    async fn singleton_owns_the_whole_ring() {
        let (_dir, node) = test_node("a:1");
        for id in [0, 1, node.me().numeric_id, node.ring().size() - 1] {
            let owner = node.find_successor(id).await.expect("singleton resolves");
            assert_eq!(owner.addr, "a:1");
        }
    }

    #[tokio::test]
    async fn singleton_put_and_find_are_local() {
        let (_dir, node) = test_node("a:1");
        let written = node.put_key("00ff", "a value", JOB_TTL).await;
        // Primary plus one replica, both landing here.
        assert_eq!(written.len(), 2);
        assert_eq!(node.store().len(), 1);
        assert_eq!(
            node.find_key("00ff", HOP_TTL, false).await.as_deref(),
            Some("a value")
        );
        assert_eq!(node.find_key("0100", HOP_TTL, false).await, None);
    }

    #[tokio::test]
    async fn find_key_honors_hop_budget() {
        let (_dir, node) = test_node("a:1");
        assert_eq!(node.find_key("00ff", 0, false).await, None);
    }

    #[test]
    fn notify_adopts_closer_predecessors() {
        let (_dir, node) = test_node("a:1");
        let ring = *node.ring();
        let me = node.me().numeric_id;
        let size = ring.size();

        // A first caller is always adopted.
        let far = NodeRecord {
            addr: "far:1".to_string(),
            id: format!("{:04x}", (me + size / 2) % size),
            numeric_id: (me + size / 2) % size,
        };
        node.notify(far.clone());
        assert_eq!(node.predecessor().unwrap().addr, "far:1");

        // A caller strictly closer counter-clockwise displaces it.
        let near = NodeRecord {
            addr: "near:1".to_string(),
            id: format!("{:04x}", (me + size - 1) % size),
            numeric_id: (me + size - 1) % size,
        };
        node.notify(near.clone());
        assert_eq!(node.predecessor().unwrap().addr, "near:1");

        // A farther caller does not.
        node.notify(far);
        assert_eq!(node.predecessor().unwrap().addr, "near:1");
    }

    #[test]
    fn get_all_hands_over_the_joiners_arc() {
        let (_dir, node) = test_node("a:1");
        let me = node.me().numeric_id;
        let size = node.ring().size();

        // Three keys: one just past us (joiner's arc), one exactly at
        // the joiner, one outside.
        let joiner = (me + 16) % size;
        let inside = format!("{:04x}", (me + 5) % size);
        let boundary = format!("{:04x}", joiner);
        let outside = format!("{:04x}", (joiner + 1) % size);
        for key in [&inside, &boundary, &outside] {
            assert!(node.store().put(key, "v", JOB_TTL));
        }

        let (mut keys, values) = node.get_all(joiner);
        keys.sort();
        let mut expected = vec![inside.clone(), boundary.clone()];
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(values.len(), 2);

        // Handed-over keys are forgotten; the rest stays.
        assert_eq!(node.store().len(), 1);
        assert!(node.store().get(&outside).is_some());
    }

    #[test]
    fn get_all_rejects_ids_outside_our_arc() {
        let (_dir, node) = test_node("a:1");
        let me = node.me().numeric_id;
        let size = node.ring().size();

        // With a predecessor set, a joiner outside (pred, me) gets nothing.
        let pred_id = (me + size - 10) % size;
        node.notify(NodeRecord {
            addr: "p:1".to_string(),
            id: format!("{:04x}", pred_id),
            numeric_id: pred_id,
        });
        assert!(node.store().put(&format!("{:04x}", (me + 2) % size), "v", JOB_TTL));

        let (keys, values) = node.get_all((me + 2) % size);
        assert!(keys.is_empty());
        assert!(values.is_empty());
        assert_eq!(node.store().len(), 1);
    }
}
