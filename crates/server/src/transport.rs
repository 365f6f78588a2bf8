//! TCP transport: framed request/response envelopes over short-lived
//! connections.

use async_trait::async_trait;
use common::{Error, Member, Result};
use protocol::{Request, Response, frame};
use raft::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Outer bound on one request/response exchange; a silent peer is retried
/// by the replication driver rather than waited on.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of the wire protocol; the context sends every outbound RPC
/// through here.
#[derive(Debug, Default)]
pub struct TcpTransport {
    correlation: AtomicU64,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn exchange(&self, to: &Member, request: &Request) -> Result<Response> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&to.address))
            .await
            .map_err(|_| Error::Transport(format!("connect {} timed out", to.address)))?
            .map_err(|e| Error::Transport(format!("connect {}: {e}", to.address)))?;

        let correlation = self.correlation.fetch_add(1, Ordering::Relaxed);
        frame::write_request_async(&mut stream, correlation, request)
            .await
            .map_err(|e| Error::Transport(format!("send to {}: {e}", to.address)))?;

        let (reply_correlation, response) = frame::read_response_async(&mut stream)
            .await
            .map_err(|e| Error::Transport(format!("receive from {}: {e}", to.address)))?;
        if reply_correlation != correlation {
            return Err(Error::Protocol(format!(
                "correlation mismatch: sent {correlation}, received {reply_correlation}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: &Member, request: Request) -> Result<Response> {
        timeout(RPC_TIMEOUT, self.exchange(to, &request))
            .await
            .map_err(|_| Error::Transport(format!("rpc to {} timed out", to.address)))?
    }
}
