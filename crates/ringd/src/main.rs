use anyhow::Context;
use clap::Parser;
use jobs::{MinioStore, ObjectStore, Registry, Worker};
use ring_id::{NodeRecord, Ring};
use ringd::{http, logging, App};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tokio::net::TcpListener;

/// A ring-organized job execution node: Chord peer, replicated
/// key/value store, job worker, and HTTP API in one process.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// host:port this node's peer RPC endpoint binds and advertises.
    /// Defaults to $HOSTNAME:6501.
    #[arg(long = "dht_address", env = "DHT_ADDRESS")]
    dht_address: Option<String>,

    /// host:port of the client HTTP API. Defaults to $HOSTNAME:8001.
    #[arg(long = "api_address", env = "API_ADDRESS")]
    api_address: Option<String>,

    /// An existing ring member to join through; omit to start a new ring.
    #[arg(long = "bootstrap_node", env = "BOOTSTRAP_NODE")]
    bootstrap_node: Option<String>,

    /// host:port of the S3-compatible object store jobs stage data in.
    /// Defaults to $HOSTNAME:9000.
    #[arg(long = "minio_url", env = "MINIO_URL")]
    minio_url: Option<String>,

    #[arg(long, env = "MINIO_ACCESS_KEY", default_value = "minioadmin")]
    minio_access_key: String,

    #[arg(long, env = "MINIO_SECRET_KEY", default_value = "minioadmin")]
    minio_secret_key: String,

    /// HMAC secret sealing stored entries. Defaults to the node's own
    /// id, which gives single-node integrity only, not inter-node
    /// authentication.
    #[arg(long = "secret-key", env = "SEC_KEY")]
    secret_key: Option<String>,

    /// Directory holding the persistent cache.
    #[arg(long = "cache-dir", env = "CACHE_DIR", default_value = "./chord_data")]
    cache_dir: std::path::PathBuf,

    /// Deadline for one peer RPC.
    #[arg(long = "rpc-timeout", env = "RPC_TIMEOUT", value_parser = humantime::parse_duration, default_value = "2s")]
    rpc_timeout: Duration,

    #[command(flatten)]
    log: logging::LogArgs,
}

fn default_address(port: u16) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{port}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log);

    let dht_address = cli.dht_address.unwrap_or_else(|| default_address(6501));
    let api_address = cli.api_address.unwrap_or_else(|| default_address(8001));
    let minio_url = cli.minio_url.unwrap_or_else(|| default_address(9000));

    // Address problems are the one fatal class; everything after
    // startup degrades and heals instead.
    let api_socket: SocketAddr = tokio::net::lookup_host(&api_address)
        .await
        .with_context(|| format!("invalid api address {api_address}"))?
        .next()
        .with_context(|| format!("api address {api_address} resolved to nothing"))?;

    let ring = Ring::default();
    let me = NodeRecord::from_addr(&ring, &dht_address);
    let secret = cli.secret_key.unwrap_or_else(|| me.id.clone());

    let store = Store::open(&cli.cache_dir, &secret, ring)
        .context("failed to open the cache directory")?;
    let node = chord::Node::new(
        &dht_address,
        ring,
        store,
        rpc::Client::new(cli.rpc_timeout),
        chord::Config::default(),
    );
    tracing::info!(me = %node.me(), api = %api_address, "starting node");

    let shutdown = tokio_util::sync::CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, shutting down");
        ctrl_c.cancel();
    });

    // The RPC endpoint must be up before joining: the ring calls back.
    let rpc_listener = TcpListener::bind(&dht_address)
        .await
        .with_context(|| format!("failed to bind peer endpoint {dht_address}"))?;
    let handler: Arc<dyn rpc::Handler> = node.clone();
    tokio::spawn(rpc::serve(rpc_listener, handler, shutdown.clone()));

    node.join(cli.bootstrap_node.as_deref())
        .await
        .context("failed to join the ring")?;
    chord::tasks::spawn_maintenance(&node, &shutdown);

    let objects: Arc<dyn ObjectStore> = Arc::new(
        MinioStore::connect(
            &format!("http://{minio_url}"),
            &cli.minio_access_key,
            &cli.minio_secret_key,
        )
        .await,
    );

    let registry = Arc::new(Registry::builtin());
    let worker = Worker::new(node.clone(), registry, objects.clone());
    tokio::spawn(worker.run(shutdown.clone()));

    let app = Arc::new(App {
        node,
        objects,
        rpc: rpc::Client::new(cli.rpc_timeout),
        next_job_id: AtomicU64::new(1),
    });
    let api_server = axum_server::bind(api_socket).serve(http::build_router(app).into_make_service());

    tokio::select! {
        served = api_server => served.context("api server failed")?,
        _ = shutdown.cancelled() => {}
    }
    Ok(())
}
