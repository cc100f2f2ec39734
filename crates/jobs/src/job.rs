use ring_id::Ring;
use sha1::{Digest, Sha1};

/// The processing steps a job can name. `launch` is not a task of its
/// own: a submission with `launch: true` fans the named task out over
/// the source bucket's objects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    Echo,
    Fitacf,
    Despeck,
    Combine,
    CombineGrid,
    MakeGrid,
    MapGrd,
}

impl TaskName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::Echo => "echo",
            TaskName::Fitacf => "fitacf",
            TaskName::Despeck => "despeck",
            TaskName::Combine => "combine",
            TaskName::CombineGrid => "combine_grid",
            TaskName::MakeGrid => "make_grid",
            TaskName::MapGrd => "map_grd",
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. Only the worker on the node holding a copy moves a
/// job forward; replicas stay pending until a failover promotes them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// A job as submitted over HTTP, before it is assigned an id and hashed.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitRequest {
    pub task: TaskName,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectname: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub launch: bool,
}

/// A unit of work addressed by the hash of its submission.
///
/// Plain data: execution is always performed by the worker dispatching
/// on `task`, never by behavior carried on the job itself. The content
/// hash is fixed at submission time, so every lifecycle transition
/// re-persists under the same key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Job {
    pub job_id: u64,
    pub task: TaskName,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectname: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub launch: bool,
    pub hash: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Key-sorted JSON: `serde_json`'s object map orders keys, so encoding
/// through `Value` yields a canonical form independent of field order.
fn canonical_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .expect("job forms always encode")
        .to_string()
}

impl Job {
    /// Build a pending job from a submission. The hash covers the
    /// submission fields only, never status or result.
    pub fn new(job_id: u64, request: SubmitRequest) -> Self {
        #[derive(serde::Serialize)]
        struct Seed<'a> {
            job_id: u64,
            #[serde(flatten)]
            request: &'a SubmitRequest,
        }
        let seed = canonical_json(&Seed {
            job_id,
            request: &request,
        });
        let hash = hex::encode(Sha1::digest(seed.as_bytes()));

        Self {
            job_id,
            task: request.task,
            args: request.args,
            source_bucket: request.source_bucket,
            dest_bucket: request.dest_bucket,
            objectname: request.objectname,
            launch: request.launch,
            hash,
            status: Status::Pending,
            result: None,
        }
    }

    /// The ring key this job lives under: the content hash truncated to
    /// the identifier width.
    pub fn dht_key(&self, ring: &Ring) -> String {
        self.hash[..ring.key_len()].to_string()
    }

    pub fn serialize(&self) -> String {
        canonical_json(self)
    }

    pub fn deserialize(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
