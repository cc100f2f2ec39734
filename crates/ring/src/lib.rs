//! Identifier-space primitives shared by every part of the ring:
//! hashing of addresses and keys into m-bit identifiers, the modular
//! arc-membership predicate, and finger spacing. Ownership, finger
//! selection, and notification checks all route through the single
//! `between` implementation here.

use sha1::{Digest, Sha1};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ring modulus m={0} must be a multiple of 4 in 4..=32")]
    InvalidModulus(u32),
    #[error("invalid hex key {0:?}")]
    InvalidKey(String),
}

/// An m-bit identifier circle of size `2^m`.
///
/// `Ring` is the narrow capability handed to components that need to
/// reason about identifiers (the store, the node, the job key
/// derivation) without holding a reference to the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    m: u32,
}

/// The deployed identifier width. 16 bits keeps hex keys at four
/// characters and the ring at 65536 slots.
pub const DEFAULT_M: u32 = 16;

impl Default for Ring {
    fn default() -> Self {
        Self { m: DEFAULT_M }
    }
}

impl Ring {
    pub fn new(m: u32) -> Result<Self, Error> {
        if m < 4 || m > 32 || m % 4 != 0 {
            return Err(Error::InvalidModulus(m));
        }
        Ok(Self { m })
    }

    pub fn bits(&self) -> u32 {
        self.m
    }

    /// Number of identifiers on the circle, `2^m`.
    pub fn size(&self) -> u64 {
        1u64 << self.m
    }

    /// Hex length of an identifier: the first m bits of a SHA-1 digest,
    /// m/4 hex characters.
    pub fn key_len(&self) -> usize {
        (self.m / 4) as usize
    }

    /// Map arbitrary bytes to an identifier: the first m bits of
    /// SHA-1(bytes) as (hex form, numeric form).
    pub fn hash_id(&self, bytes: &[u8]) -> (String, u64) {
        let digest = Sha1::digest(bytes);
        let hex = hex::encode(digest)[..self.key_len()].to_string();
        let numeric = u64::from_str_radix(&hex, 16).expect("sha1 hex is valid hex") % self.size();
        (hex, numeric)
    }

    /// Numeric form of an already-hashed hex key.
    pub fn numeric(&self, key: &str) -> Result<u64, Error> {
        u64::from_str_radix(key, 16)
            .map(|n| n % self.size())
            .map_err(|_| Error::InvalidKey(key.to_string()))
    }

    /// The identifier finger `i` should track: `(id + 2^i) mod 2^m`.
    pub fn finger_target(&self, id: u64, i: u32) -> u64 {
        debug_assert!(i < self.m);
        (id.wrapping_add(1u64 << i)) % self.size()
    }
}

/// Membership of `x` in the arc that proceeds clockwise from `left` to
/// `right` on a circle of `ring_size` identifiers.
///
/// Inclusivity widens the corresponding endpoint by one slot. When the
/// endpoints coincide the arc is the whole circle minus the endpoint,
/// and any inclusive endpoint extends it to the full circle.
pub fn between(
    x: u64,
    left: u64,
    right: u64,
    incl_left: bool,
    incl_right: bool,
    ring_size: u64,
) -> bool {
    if left == right {
        return incl_left || incl_right || x != left;
    }
    let left = if incl_left {
        (left + ring_size - 1) % ring_size
    } else {
        left
    };
    let right = if incl_right { (right + 1) % ring_size } else { right };
    if left == right {
        // Widening closed the gap: everything but the pivot qualifies.
        x != left
    } else if left < right {
        left < x && x < right
    } else {
        x > left.max(right) || x < left.min(right)
    }
}

/// A peer as exchanged by value between nodes: its RPC address and the
/// two forms of its identifier.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeRecord {
    pub addr: String,
    pub id: String,
    pub numeric_id: u64,
}

impl NodeRecord {
    /// Derive the record for a peer from its `host:port` address.
    pub fn from_addr(ring: &Ring, addr: &str) -> Self {
        let (id, numeric_id) = ring.hash_id(addr.as_bytes());
        Self {
            addr: addr.to_string(),
            id,
            numeric_id,
        }
    }
}

impl std::fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
