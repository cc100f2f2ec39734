//! Peer-to-peer transport: one fresh TCP connection per call carrying a
//! single length-prefixed JSON request frame and a single response frame.
//!
//! The typed client wrappers fold every transport failure (refused
//! connection, timeout, undecodable frame) into the per-call neutral
//! value, so routing and maintenance code never branches on transport
//! errors; the periodic repair tasks are what notice and heal dead peers.

use futures::{SinkExt, TryStreamExt};
use ring_id::NodeRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

mod client;
pub use client::Client;

/// Per-call deadline covering connect, send, and the response read.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_FRAME_LENGTH: usize = 1 << 24; // 16 MiB

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to reach peer {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o failure talking to peer")]
    Io(#[from] std::io::Error),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to decode peer frame")]
    Decode(#[source] serde_json::Error),
    #[error("peer closed the connection before responding")]
    Eof,
    #[error("peer reported: {0}")]
    Peer(String),
}

/// One call, as framed on the wire.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Ping,
    FindSuccessor {
        numeric_id: u64,
    },
    GetPredAndSucclist,
    Notify {
        node: NodeRecord,
    },
    SaveKey {
        key: String,
        value: String,
        ttl_secs: u64,
    },
    PutKey {
        key: String,
        value: String,
        ttl_secs: u64,
    },
    FindKey {
        key: String,
        ttl: u32,
        is_replica: bool,
    },
    FindJob {
        job_hash: String,
        ttl: u32,
        is_replica: bool,
    },
    GetAll {
        node_id: u64,
    },
}

/// The reply to one call. `Error` is only produced for requests the
/// handler could not interpret; per-method failures use that method's
/// neutral payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Successor {
        found: bool,
        node: Option<NodeRecord>,
    },
    PredAndSucclist {
        predecessor: Option<NodeRecord>,
        successors: Vec<NodeRecord>,
    },
    Notified,
    Saved {
        ok: bool,
    },
    Put {
        keys: Vec<String>,
    },
    Value {
        value: Option<String>,
    },
    All {
        keys: Vec<String>,
        values: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// The node-side dispatch surface. Implementations must be cheap to
/// call concurrently; one task is spawned per inbound connection.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub(crate) fn framed(socket: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(socket, codec())
}

/// Accept and serve peer calls until `shutdown` fires. Each connection
/// is one request/response exchange on its own task; a failed exchange
/// is logged and dropped without affecting the listener.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((socket, addr)) = accepted else {
                    continue;
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(socket, handler).await {
                        tracing::debug!(%addr, %error, "peer exchange failed");
                    }
                });
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn serve_connection(socket: TcpStream, handler: Arc<dyn Handler>) -> Result<(), Error> {
    let mut framed = framed(socket);
    let Some(frame) = framed.try_next().await? else {
        return Ok(()); // Peer probed the port and went away.
    };
    let response = match serde_json::from_slice::<Request>(&frame) {
        Ok(request) => handler.handle(request).await,
        Err(error) => Response::Error {
            message: format!("undecodable request: {error}"),
        },
    };
    let encoded = serde_json::to_vec(&response).expect("responses always encode");
    framed.send(encoded.into()).await?;
    Ok(())
}
