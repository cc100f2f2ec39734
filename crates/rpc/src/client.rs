use crate::{framed, Error, Request, Response, CALL_TIMEOUT};
use futures::{SinkExt, TryStreamExt};
use ring_id::NodeRecord;
use std::time::Duration;
use tokio::net::TcpStream;

/// Typed caller for the peer RPC surface.
///
/// `call` reports transport errors; the per-method wrappers below fold
/// them into each method's neutral failure value so callers can treat a
/// dead peer and a negative answer uniformly.
#[derive(Debug, Clone)]
pub struct Client {
    timeout: Duration,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            timeout: CALL_TIMEOUT,
        }
    }
}

impl Client {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// One connection, one request frame, one response frame.
    pub async fn call(&self, addr: &str, request: &Request) -> Result<Response, Error> {
        let exchange = async {
            let socket = TcpStream::connect(addr)
                .await
                .map_err(|source| Error::Connect {
                    addr: addr.to_string(),
                    source,
                })?;
            let mut framed = framed(socket);

            let encoded = serde_json::to_vec(request).expect("requests always encode");
            framed.send(encoded.into()).await?;

            let frame = framed.try_next().await?.ok_or(Error::Eof)?;
            serde_json::from_slice::<Response>(&frame).map_err(Error::Decode)
        };
        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        match response {
            Response::Error { message } => Err(Error::Peer(message)),
            response => Ok(response),
        }
    }

    /// Liveness probe; false covers dead and misbehaving peers alike.
    pub async fn ping(&self, addr: &str) -> bool {
        matches!(self.call(addr, &Request::Ping).await, Ok(Response::Pong))
    }

    pub async fn find_successor(&self, addr: &str, numeric_id: u64) -> (bool, Option<NodeRecord>) {
        match self.call(addr, &Request::FindSuccessor { numeric_id }).await {
            Ok(Response::Successor { found, node }) => (found, node),
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected find_successor reply");
                (false, None)
            }
            Err(error) => {
                tracing::debug!(addr, %error, "find_successor call failed");
                (false, None)
            }
        }
    }

    pub async fn get_pred_and_succlist(&self, addr: &str) -> (Option<NodeRecord>, Vec<NodeRecord>) {
        match self.call(addr, &Request::GetPredAndSucclist).await {
            Ok(Response::PredAndSucclist {
                predecessor,
                successors,
            }) => (predecessor, successors),
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected get_pred_and_succlist reply");
                (None, Vec::new())
            }
            Err(error) => {
                tracing::debug!(addr, %error, "get_pred_and_succlist call failed");
                (None, Vec::new())
            }
        }
    }

    pub async fn notify(&self, addr: &str, node: NodeRecord) {
        if let Err(error) = self.call(addr, &Request::Notify { node }).await {
            tracing::debug!(addr, %error, "notify call failed");
        }
    }

    pub async fn save_key(
        &self,
        addr: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Option<bool> {
        let request = Request::SaveKey {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs: ttl.as_secs(),
        };
        match self.call(addr, &request).await {
            Ok(Response::Saved { ok }) => Some(ok),
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected save_key reply");
                None
            }
            Err(error) => {
                tracing::debug!(addr, %error, "save_key call failed");
                None
            }
        }
    }

    pub async fn put_key(
        &self,
        addr: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Option<Vec<String>> {
        let request = Request::PutKey {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs: ttl.as_secs(),
        };
        match self.call(addr, &request).await {
            Ok(Response::Put { keys }) => Some(keys),
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected put_key reply");
                None
            }
            Err(error) => {
                tracing::debug!(addr, %error, "put_key call failed");
                None
            }
        }
    }

    pub async fn find_key(
        &self,
        addr: &str,
        key: &str,
        ttl: u32,
        is_replica: bool,
    ) -> Option<String> {
        let request = Request::FindKey {
            key: key.to_string(),
            ttl,
            is_replica,
        };
        match self.call(addr, &request).await {
            Ok(Response::Value { value }) => value,
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected find_key reply");
                None
            }
            Err(error) => {
                tracing::debug!(addr, %error, "find_key call failed");
                None
            }
        }
    }

    pub async fn find_job(
        &self,
        addr: &str,
        job_hash: &str,
        ttl: u32,
        is_replica: bool,
    ) -> Option<String> {
        let request = Request::FindJob {
            job_hash: job_hash.to_string(),
            ttl,
            is_replica,
        };
        match self.call(addr, &request).await {
            Ok(Response::Value { value }) => value,
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected find_job reply");
                None
            }
            Err(error) => {
                tracing::debug!(addr, %error, "find_job call failed");
                None
            }
        }
    }

    /// Claim every key owned by `node_id` from the peer; the peer
    /// deletes what it returns. `None` distinguishes an unreachable
    /// peer from an empty (but successful) handoff.
    pub async fn get_all(&self, addr: &str, node_id: u64) -> Option<(Vec<String>, Vec<String>)> {
        match self.call(addr, &Request::GetAll { node_id }).await {
            Ok(Response::All { keys, values }) => Some((keys, values)),
            Ok(other) => {
                tracing::debug!(addr, ?other, "unexpected get_all reply");
                None
            }
            Err(error) => {
                tracing::debug!(addr, %error, "get_all call failed");
                None
            }
        }
    }
}
