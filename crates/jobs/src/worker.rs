use crate::{Job, NodeCtx, ObjectStore, Registry, Status};
use chord::JOB_TTL;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The per-node drain loop: claim every locally stored job, run the
/// pending ones, and write every surviving form back under its key.
///
/// The drain is destructive, which is what keeps two workers from
/// picking up the same copy; anything that must outlive the tick
/// (terminal states, the running marker, undecodable payloads) is
/// re-persisted inside the loop.
pub struct Worker {
    node: Arc<chord::Node>,
    registry: Arc<Registry>,
    objects: Arc<dyn ObjectStore>,
}

impl Worker {
    pub fn new(
        node: Arc<chord::Node>,
        registry: Arc<Registry>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            node,
            registry,
            objects,
        }
    }

    /// Run until shutdown, one drain pass per interval. Job failures
    /// mark the job failed; they never end the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        let interval = self.node.config().interval;
        tracing::info!(me = %self.node.me(), "worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.tick().await,
            }
        }
        tracing::debug!(me = %self.node.me(), "worker stopped");
    }

    /// One drain pass. Public so tests can step the worker without the
    /// timing loop.
    pub async fn tick(&self) {
        for (key, serialized) in self.node.store().drain_jobs() {
            self.process(&key, serialized).await;
        }
    }

    async fn process(&self, key: &str, serialized: String) {
        let store = self.node.store();
        let mut job = match Job::deserialize(&serialized) {
            Ok(job) => job,
            Err(error) => {
                tracing::warn!(key, %error, "re-persisting undecodable job untouched");
                store.put(key, &serialized, JOB_TTL);
                return;
            }
        };

        match job.status {
            // Terminal and in-flight forms ride through the drain.
            Status::Completed | Status::Failed | Status::Running => {
                store.put(key, &serialized, JOB_TTL);
            }
            Status::Pending => {
                job.status = Status::Running;
                store.put(key, &job.serialize(), JOB_TTL);
                tracing::info!(key, job_id = job.job_id, task = %job.task, "running job");

                let ctx = NodeCtx {
                    node: self.node.clone(),
                    objects: self.objects.clone(),
                };
                match self.registry.dispatch(&job, &ctx).await {
                    Ok(result) => {
                        job.status = Status::Completed;
                        job.result = Some(result);
                        tracing::info!(key, job_id = job.job_id, "job completed");
                    }
                    Err(error) => {
                        tracing::warn!(key, job_id = job.job_id, error = ?error, "job failed");
                        job.status = Status::Failed;
                        job.result = Some(serde_json::Value::String(format!("{error:#}")));
                    }
                }
                store.put(key, &job.serialize(), JOB_TTL);
            }
        }
    }
}
