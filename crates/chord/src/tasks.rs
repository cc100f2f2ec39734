//! The periodic maintenance loops every node runs: stabilize,
//! fix_fingers, check_predecessor, and successor-list repair. Each loop
//! sleeps its interval, runs one iteration to completion, and exits at
//! the next tick after shutdown is signaled; iterations never overlap
//! themselves and nothing they encounter is fatal.

use crate::Node;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

macro_rules! periodic {
    ($name:literal, $node:expr, $shutdown:expr, $step:ident) => {{
        let node = Arc::clone($node);
        let shutdown = $shutdown.clone();
        tokio::spawn(async move {
            let interval = node.config().interval;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => node.$step().await,
                }
            }
            tracing::debug!(task = $name, me = %node.me(), "maintenance loop stopped");
        })
    }};
}

/// Spawn the four ring-maintenance loops for `node`. The returned
/// handles are only needed by callers that want to await full shutdown.
pub fn spawn_maintenance(node: &Arc<Node>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        periodic!("stabilize", node, shutdown, stabilize_once),
        periodic!("fix_fingers", node, shutdown, fix_fingers_once),
        periodic!("check_predecessor", node, shutdown, check_predecessor_once),
        periodic!("fix_successor_list", node, shutdown, fix_successor_list_once),
    ]
}
