//! The HTTP facade end to end against a real in-process node: submit a
//! job, run the worker, and read it back through every endpoint.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use jobs::{ObjectStore, Registry, Worker};
use ring_id::Ring;
use ringd::{http, App};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use store::Store;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct NoObjects;

#[async_trait::async_trait]
impl ObjectStore for NoObjects {
    async fn healthy(&self) -> bool {
        false
    }
    async fn list_objects(&self, _bucket: &str) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("no object store in this test")
    }
    async fn get_object(&self, _bucket: &str, _object: &str) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("no object store in this test")
    }
    async fn put_object(&self, _bucket: &str, _object: &str, _body: Vec<u8>) -> anyhow::Result<()> {
        anyhow::bail!("no object store in this test")
    }
}

struct TestDaemon {
    app: Arc<App>,
    router: axum::Router,
    worker: Worker,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

async fn start_daemon() -> TestDaemon {
    let port = portpicker::pick_unused_port().expect("no free port");
    let addr = format!("127.0.0.1:{port}");
    let ring = Ring::default();
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path(), "test-secret", ring).unwrap();
    let node = chord::Node::new(
        &addr,
        ring,
        store,
        rpc::Client::default(),
        chord::Config::default(),
    );

    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind(&addr).await.unwrap();
    let handler: Arc<dyn rpc::Handler> = node.clone();
    tokio::spawn(rpc::serve(listener, handler, shutdown.clone()));
    node.join(None).await.unwrap();

    let objects: Arc<dyn ObjectStore> = Arc::new(NoObjects);
    let worker = Worker::new(node.clone(), Arc::new(Registry::builtin()), objects.clone());
    let app = Arc::new(App {
        node,
        objects,
        rpc: rpc::Client::default(),
        next_job_id: AtomicU64::new(1),
    });
    let router = http::build_router(app.clone());

    TestDaemon {
        app,
        router,
        worker,
        shutdown,
        _dir: dir,
    }
}

async fn call(router: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn submit_run_and_read_back() {
    let daemon = start_daemon().await;

    let (status, body) = call(
        &daemon.router,
        post_json("/submit", serde_json::json!({"task": "echo", "args": ["hi"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], 1);
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 2, "primary and replica key");
    let key = keys[0].as_str().unwrap().to_string();

    // Before the worker runs, the job reads back pending.
    let (status, body) = call(&daemon.router, get(&format!("/getjob?hash={key}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    daemon.worker.tick().await;

    let (status, body) = call(&daemon.router, get(&format!("/getjob?hash={key}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"]["echo"], "hi");

    // The local listing reflects the same terminal state.
    let (status, body) = call(&daemon.router, get("/getjobs")).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body["jobs"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["status"], "completed");
    assert_eq!(listed[0]["job_id"], key);
    assert_eq!(
        listed[0]["server_idx"],
        daemon.app.node.me().id.as_str()
    );

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn unknown_jobs_are_404() {
    let daemon = start_daemon().await;
    let (status, body) = call(&daemon.router, get("/getjob?hash=00ff")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Job not found");
    daemon.shutdown.cancel();
}

#[tokio::test]
async fn status_and_finger_report_ring_state() {
    let daemon = start_daemon().await;

    let (status, body) = call(&daemon.router, get("/getstatus")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chord"], "online");
    assert_eq!(body["storage"], "offline");

    let (status, body) = call(&daemon.router, get("/getfinger")).await;
    assert_eq!(status, StatusCode::OK);
    let finger = body["finger"].as_array().unwrap();
    assert_eq!(finger.len(), 1, "singleton fingers collapse to one address");
    assert_eq!(finger[0], daemon.app.node.me().addr.as_str());

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn index_is_served() {
    let daemon = start_daemon().await;
    let response = daemon
        .router
        .clone()
        .oneshot(get("/"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("ringd"));
    daemon.shutdown.cancel();
}
