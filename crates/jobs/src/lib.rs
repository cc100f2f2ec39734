//! The job layer on top of the ring: the plain-data job model, the task
//! registry the worker dispatches against, the object-storage capability
//! jobs stage their inputs through, and the per-node worker loop that
//! drives jobs from pending to a terminal state.

mod job;
mod objstore;
mod registry;
mod worker;

pub use job::{Job, Status, SubmitRequest, TaskName};
pub use objstore::{MinioStore, ObjectStore};
pub use registry::{NodeCtx, Registry, TaskHandler};
pub use worker::Worker;

/// Serialize `job` and place it (and its replicas) on the ring under
/// its content-hash key. Returns the keys written, empty on total
/// placement failure.
pub async fn put_job(node: &chord::Node, job: &Job) -> Vec<String> {
    let key = job.dht_key(node.ring());
    tracing::debug!(key, job_id = job.job_id, task = %job.task, "placing job");
    node.put_key(&key, &job.serialize(), chord::JOB_TTL).await
}
