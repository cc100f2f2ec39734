//! The node daemon: one process serving the peer RPC endpoint, the ring
//! maintenance loops, the job worker, and the client-facing HTTP API.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub mod http;
pub mod logging;

/// Shared state behind the HTTP surface.
pub struct App {
    pub node: Arc<chord::Node>,
    pub objects: Arc<dyn jobs::ObjectStore>,
    pub rpc: rpc::Client,
    /// Monotonic per-submitter job ids; informational, not unique
    /// across the ring.
    pub next_job_id: AtomicU64,
}
