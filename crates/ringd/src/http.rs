//! The client-facing HTTP surface: job submission and retrieval, plus
//! small introspection endpoints over the node's ring state.

use crate::App;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use jobs::{Job, SubmitRequest};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

static INDEX: &str = r#"<!doctype html>
<html>
  <head><title>ringd</title></head>
  <body>
    <h1>ringd</h1>
    <p>A ring-organized job execution node.</p>
    <ul>
      <li><code>POST /submit</code> &mdash; submit a job</li>
      <li><code>GET /getjob?hash=HEX</code> &mdash; fetch one job</li>
      <li><code>GET /getjobs</code> &mdash; jobs stored on this node</li>
      <li><code>GET /getstatus</code> &mdash; ring and storage health</li>
      <li><code>GET /getfinger</code> &mdash; routing table summary</li>
    </ul>
  </body>
</html>
"#;

pub fn build_router(app: Arc<App>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/", get(index))
        .route("/submit", post(submit))
        .route("/getjob", get(get_job))
        .route("/getjobs", get(get_jobs))
        .route("/getstatus", get(get_status))
        .route("/getfinger", get(get_finger))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

async fn index() -> Html<&'static str> {
    Html(INDEX)
}

/// Hash the submission, route it to its owners, and report the keys it
/// was stored under.
#[tracing::instrument(skip_all)]
async fn submit(
    State(app): State<Arc<App>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let job_id = app.next_job_id.fetch_add(1, Ordering::Relaxed);
    let job = Job::new(job_id, request);
    let keys = jobs::put_job(&app.node, &job).await;
    if keys.is_empty() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "job could not be placed on the ring" })),
        )
            .into_response();
    }
    Json(json!({ "job_id": job_id, "keys": keys })).into_response()
}

#[derive(Debug, serde::Deserialize)]
struct GetJobParams {
    hash: String,
}

#[tracing::instrument(skip(app))]
async fn get_job(
    State(app): State<Arc<App>>,
    Query(params): Query<GetJobParams>,
) -> Response {
    match app.node.find_job(&params.hash, chord::HOP_TTL, false).await {
        Some(serialized) => match Job::deserialize(&serialized) {
            Ok(job) => Json(job).into_response(),
            Err(error) => {
                tracing::warn!(hash = params.hash, %error, "stored job is undecodable");
                not_found()
            }
        },
        None => not_found(),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Job not found" })),
    )
        .into_response()
}

/// Jobs currently stored on this node only; no routing.
async fn get_jobs(State(app): State<Arc<App>>) -> Response {
    let server_idx = app.node.me().id.clone();
    let jobs: Vec<serde_json::Value> = app
        .node
        .store()
        .iter_mine()
        .into_iter()
        .filter_map(|(key, serialized)| match Job::deserialize(&serialized) {
            Ok(job) => Some(json!({
                "server_idx": server_idx,
                "status": job.status,
                "result": job.result,
                "job_id": key,
            })),
            Err(_) => None,
        })
        .collect();
    Json(json!({ "jobs": jobs })).into_response()
}

/// Liveness of the two planes this node fronts.
async fn get_status(State(app): State<Arc<App>>) -> Response {
    let chord = app.rpc.ping(&app.node.me().addr).await;
    let storage = app.objects.healthy().await;
    let label = |ok: bool| if ok { "online" } else { "offline" };
    Json(json!({ "chord": label(chord), "storage": label(storage) })).into_response()
}

/// Unique finger addresses, in table order.
async fn get_finger(State(app): State<Arc<App>>) -> Response {
    let mut finger: Vec<String> = Vec::new();
    for record in app.node.fingers() {
        if !finger.contains(&record.addr) {
            finger.push(record.addr);
        }
    }
    Json(json!({ "finger": finger })).into_response()
}
