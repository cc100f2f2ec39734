use crate::{put_job, Job, ObjectStore, SubmitRequest, TaskName};
use anyhow::{bail, Context};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a task handler may touch: the node handle for placing follow-up
/// jobs and the object-storage capability. Handlers never reach into
/// the local store or routing state directly.
#[derive(Clone)]
pub struct NodeCtx {
    pub node: Arc<chord::Node>,
    pub objects: Arc<dyn ObjectStore>,
}

/// A task implementation. Handlers run on the worker loop; their result
/// is opaque to the core and lands verbatim in the job's `result`.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, job: &Job, ctx: &NodeCtx) -> anyhow::Result<serde_json::Value>;
}

/// Maps task names to their handlers. Fan-out submissions
/// (`launch: true`) are dispatched to the launcher regardless of task,
/// which regroups the bucket and spawns per-group jobs of that task.
pub struct Registry {
    handlers: HashMap<TaskName, Arc<dyn TaskHandler>>,
    launcher: Arc<dyn TaskHandler>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            launcher: Arc::new(LaunchTask),
        }
    }

    /// All built-in tasks.
    pub fn builtin() -> Self {
        Self::new()
            .register(TaskName::Echo, EchoTask)
            .register(TaskName::Fitacf, PipelineTask(TaskName::Fitacf))
            .register(TaskName::Despeck, PipelineTask(TaskName::Despeck))
            .register(TaskName::Combine, PipelineTask(TaskName::Combine))
            .register(TaskName::CombineGrid, PipelineTask(TaskName::CombineGrid))
            .register(TaskName::MakeGrid, PipelineTask(TaskName::MakeGrid))
            .register(TaskName::MapGrd, PipelineTask(TaskName::MapGrd))
    }

    pub fn register<H: TaskHandler>(mut self, task: TaskName, handler: H) -> Self {
        if self.handlers.insert(task, Arc::new(handler)).is_some() {
            panic!("a handler for {task} is already registered");
        }
        self
    }

    pub async fn dispatch(&self, job: &Job, ctx: &NodeCtx) -> anyhow::Result<serde_json::Value> {
        if job.launch {
            return self.launcher.run(job, ctx).await;
        }
        match self.handlers.get(&job.task) {
            Some(handler) => handler.run(job, ctx).await,
            None => bail!("no handler registered for task {}", job.task),
        }
    }
}

/// Smoke-test task: reflects its arguments back as the result.
struct EchoTask;

#[async_trait::async_trait]
impl TaskHandler for EchoTask {
    async fn run(&self, job: &Job, _ctx: &NodeCtx) -> anyhow::Result<serde_json::Value> {
        Ok(json!({ "echo": job.args.join(" ") }))
    }
}

/// The radar-processing family: stage the named objects from the source
/// bucket, run the task's shell pipeline over them, and upload the
/// product to the destination bucket.
struct PipelineTask(TaskName);

#[async_trait::async_trait]
impl TaskHandler for PipelineTask {
    async fn run(&self, job: &Job, ctx: &NodeCtx) -> anyhow::Result<serde_json::Value> {
        let source_bucket = job
            .source_bucket
            .as_deref()
            .context("pipeline task needs source_bucket")?;
        let dest_bucket = job
            .dest_bucket
            .as_deref()
            .context("pipeline task needs dest_bucket")?;
        let objectname = job
            .objectname
            .as_deref()
            .context("pipeline task needs objectname")?;

        let staging = tempfile::tempdir().context("failed to create staging directory")?;
        let mut files = Vec::new();
        for object in objectname.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let bytes = ctx.objects.get_object(source_bucket, object).await?;
            let filename = object.rsplit('/').next().unwrap_or(object);
            let path = staging.path().join(filename);
            tokio::fs::write(&path, &bytes)
                .await
                .with_context(|| format!("failed to stage {object}"))?;
            files.push(path.to_string_lossy().into_owned());
        }
        if files.is_empty() {
            bail!("objectname named no objects");
        }

        let product = output_name(self.0, objectname);
        let product_file = product.rsplit('/').next().unwrap_or(&product);
        let dest_path = staging.path().join(product_file);
        let command =
            pipeline_command(self.0, &files, &dest_path.to_string_lossy(), &job.args);

        tracing::debug!(%command, "running pipeline");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .await
            .context("failed to spawn pipeline")?;
        if !output.status.success() {
            bail!(
                "pipeline exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let produced = tokio::fs::read(&dest_path)
            .await
            .with_context(|| format!("pipeline produced no {product_file}"))?;
        let bytes = produced.len();
        ctx.objects.put_object(dest_bucket, &product, produced).await?;

        Ok(json!({ "object": product, "bytes": bytes }))
    }
}

/// Fan a task out over the source bucket: list it, group the objects the
/// way the task expects its inputs batched, and place one child job per
/// group back on the ring.
struct LaunchTask;

#[async_trait::async_trait]
impl TaskHandler for LaunchTask {
    async fn run(&self, job: &Job, ctx: &NodeCtx) -> anyhow::Result<serde_json::Value> {
        let source_bucket = job
            .source_bucket
            .as_deref()
            .context("launch needs source_bucket")?;
        let objects = ctx.objects.list_objects(source_bucket).await?;
        let groups = group_objects(job.task, &objects);

        let mut spawned = 0u64;
        for (index, group) in groups.iter().enumerate() {
            let child = Job::new(
                job.job_id + 1 + index as u64,
                SubmitRequest {
                    task: job.task,
                    args: job.args.clone(),
                    source_bucket: job.source_bucket.clone(),
                    dest_bucket: job.dest_bucket.clone(),
                    objectname: Some(group.join(",")),
                    launch: false,
                },
            );
            if !put_job(&ctx.node, &child).await.is_empty() {
                spawned += 1;
            } else {
                tracing::warn!(task = %job.task, group = index, "failed to place child job");
            }
        }
        Ok(json!({ "groups": groups.len(), "spawned": spawned }))
    }
}

/// The shell pipeline for one task over already-staged `files`.
fn pipeline_command(task: TaskName, files: &[String], dest: &str, args: &[String]) -> String {
    let files = files.join(" ");
    match task {
        TaskName::Echo => format!("echo {} > {dest}", args.join(" ")),
        TaskName::Fitacf => format!("make_fit -fitacf3 {files} > {dest}"),
        TaskName::Despeck => format!("fit_speck_removal {files} > {dest}"),
        TaskName::Combine => format!("cat {files} > {dest}"),
        TaskName::CombineGrid => format!("combine_grid {files} > {dest}"),
        TaskName::MakeGrid => {
            format!("make_grid {files} {} > {dest}", args.join(" "))
        }
        TaskName::MapGrd => {
            let imf = args.first().map(String::as_str).unwrap_or_default();
            let params = args.get(1..).unwrap_or_default().join(" ");
            format!(
                "map_grd {files} | map_addhmb | map_addimf -if {imf} | map_addmodel {params} | map_fit > {dest}"
            )
        }
    }
}

/// Name of the product a task derives from its inputs.
fn output_name(task: TaskName, objectname: &str) -> String {
    let first = objectname
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(objectname);
    match task {
        TaskName::Echo => first.to_string(),
        TaskName::Fitacf => first.replace(".rawacf", ".fitacf3").replace(".bz2", ""),
        TaskName::Despeck => first.replace(".fitacf3", ".despeck.fitacf3"),
        TaskName::Combine => format!("{}.daily", date_stem(first)),
        TaskName::CombineGrid => format!("{}.north.grd", date_stem(first)),
        TaskName::MakeGrid => first
            .replace(".despeck", "")
            .replace(".fitacf3", ".grd")
            .replace(".bz2", ""),
        TaskName::MapGrd => first.replace(".grd", ".map"),
    }
}

/// Leading date component of an object name (the `YYYYMMDD` prefix of
/// its file part), falling back to the whole stem.
fn date_stem(object: &str) -> String {
    let file = object.rsplit('/').next().unwrap_or(object);
    let stem = file.split('.').next().unwrap_or(file);
    stem.get(..8).unwrap_or(stem).to_string()
}

/// How a task wants its inputs batched: the daily combiners pool
/// same-date objects, everything else processes objects one at a time.
fn group_objects(task: TaskName, objects: &[String]) -> Vec<Vec<String>> {
    match task {
        TaskName::Combine | TaskName::CombineGrid => {
            let mut by_date: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for object in objects {
                by_date
                    .entry(date_stem(object))
                    .or_default()
                    .push(object.clone());
            }
            by_date.into_values().collect()
        }
        _ => objects.iter().map(|object| vec![object.clone()]).collect(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pipeline_commands_render() {
        let files = vec!["/tmp/a.rawacf".to_string(), "/tmp/b.rawacf".to_string()];
        assert_eq!(
            pipeline_command(TaskName::Fitacf, &files, "/tmp/out", &[]),
            "make_fit -fitacf3 /tmp/a.rawacf /tmp/b.rawacf > /tmp/out"
        );
        assert_eq!(
            pipeline_command(TaskName::Combine, &files, "/tmp/out", &[]),
            "cat /tmp/a.rawacf /tmp/b.rawacf > /tmp/out"
        );
        let cmd = pipeline_command(
            TaskName::MapGrd,
            &files,
            "/tmp/out",
            &["imf.txt".to_string(), "-extra".to_string()],
        );
        assert!(cmd.contains("map_addimf -if imf.txt"));
        assert!(cmd.contains("map_addmodel -extra"));
        assert!(cmd.ends_with("> /tmp/out"));
    }

    #[test]
    fn output_names_follow_the_task() {
        assert_eq!(
            output_name(TaskName::Fitacf, "20240101.0001.00.kod.rawacf.bz2"),
            "20240101.0001.00.kod.fitacf3"
        );
        assert_eq!(
            output_name(TaskName::Despeck, "20240101.0001.00.kod.fitacf3"),
            "20240101.0001.00.kod.despeck.fitacf3"
        );
        assert_eq!(
            output_name(TaskName::MakeGrid, "20240101.0001.00.kod.despeck.fitacf3"),
            "20240101.0001.00.kod.grd"
        );
        assert_eq!(
            output_name(TaskName::MapGrd, "20240101.north.grd"),
            "20240101.north.map"
        );
        assert_eq!(
            output_name(TaskName::CombineGrid, "radar/20240101.0001.00.kod.grd"),
            "20240101.north.grd"
        );
    }

    #[test]
    fn grouping_pools_daily_combiners_only() {
        let objects = vec![
            "20240101.0001.00.kod.grd".to_string(),
            "20240101.0002.00.kod.grd".to_string(),
            "20240102.0001.00.kod.grd".to_string(),
        ];

        let groups = group_objects(TaskName::CombineGrid, &objects);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);

        let groups = group_objects(TaskName::Fitacf, &objects);
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|group| group.len() == 1));
    }
}
