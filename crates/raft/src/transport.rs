//! The pluggable message-passing seam.
//!
//! A transport carries one framed request to a member and returns its framed
//! response. The server crate ships a TCP implementation; tests use an
//! in-memory one. Failures surface as `Error::Transport` and are retried by
//! the replication driver on the next heartbeat.

use async_trait::async_trait;
use common::{Member, Result};
use protocol::{Request, Response};

/// Message-passing layer between cluster members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` to `to` and await its response.
    async fn send(&self, to: &Member, request: Request) -> Result<Response>;
}
