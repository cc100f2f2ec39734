//! Ring membership, routing, and the replicated key/value layer.
//!
//! A `Node` owns its slice of the identifier circle: it tracks a
//! predecessor, a successor list, and a finger table, repairs them with
//! the periodic maintenance loops in [`tasks`], and serves the peer RPC
//! surface. Keys are placed positionally: the primary copy at the key's
//! identifier, replica `r` at `id + r`, so a failed primary's data is
//! one successor hop away.

mod node;
pub mod tasks;

pub use node::{Config, Node};

use std::time::Duration;

/// Lifetime of a stored job entry.
pub const JOB_TTL: Duration = Duration::from_secs(3600);

/// Hop budget attached to recursive key lookups. A budget, not a
/// duration: each forwarded hop decrements it and zero stops the walk.
pub const HOP_TTL: u32 = 4;
