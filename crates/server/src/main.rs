//! TCP server hosting one Raft member.
//!
//! Accepts framed protocol connections from peers and clients, routes every
//! request into the member's Raft context, and replicates a key/value state
//! machine. Peers are configured with repeated `--member id=host:port`
//! flags; append `:passive` for non-voting members.

mod machine;
mod transport;

use anyhow::Result;
use clap::Parser;
use common::{Config, Member, MemberId, MemberType};
use log::{debug, error, info, warn};
use protocol::frame;
use raft::{RaftContext, RaftHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "copycat-server", about = "A Raft-replicated key/value server")]
struct Args {
    /// This member's id; must appear in the member list
    #[arg(long)]
    id: MemberId,

    /// Address to listen on, e.g. 127.0.0.1:5001
    #[arg(long)]
    listen: String,

    /// Cluster members as `id=host:port` (append `:passive` for a
    /// non-voting member); repeat for each member, the local one included
    #[arg(long = "member", value_parser = parse_member, required = true)]
    members: Vec<Member>,

    /// Directory for segment files and node metadata
    #[arg(long, default_value = "./copycat_data")]
    data_dir: PathBuf,

    /// Log name (segment filename prefix)
    #[arg(long, default_value = "copycat")]
    name: String,

    /// Base election timeout in milliseconds; the actual timeout is
    /// randomized in [T, 2T)
    #[arg(long, default_value_t = 500)]
    election_timeout_ms: u64,

    /// Heartbeat and gossip period in milliseconds
    #[arg(long, default_value_t = 150)]
    heartbeat_interval_ms: u64,

    /// Hard cap on a single entry record, in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_entry_size: usize,

    /// Soft cap on a segment before rotation, in bytes
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    max_segment_size: usize,

    /// Cap on entries per segment
    #[arg(long, default_value_t = 1024 * 1024)]
    max_entries_per_segment: usize,
}

fn parse_member(value: &str) -> Result<Member, String> {
    let (id, rest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {value:?}"))?;
    let id: MemberId = id
        .parse()
        .map_err(|e| format!("bad member id {id:?}: {e}"))?;
    let (address, member_type) = match rest.strip_suffix(":passive") {
        Some(address) => (address, MemberType::Passive),
        None => (rest, MemberType::Active),
    };
    Ok(Member::new(id, address, member_type))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let member_type = args
        .members
        .iter()
        .find(|m| m.id == args.id)
        .map(|m| m.member_type)
        .unwrap_or(MemberType::Active);

    let config = Config::builder()
        .directory(args.data_dir.clone())
        .name(args.name.clone())
        .max_entry_size(args.max_entry_size)
        .max_segment_size(args.max_segment_size)
        .max_entries_per_segment(args.max_entries_per_segment)
        .election_timeout(Duration::from_millis(args.election_timeout_ms))
        .heartbeat_interval(Duration::from_millis(args.heartbeat_interval_ms))
        .members(args.members.clone())
        .member_type(member_type)
        .build();

    let handle = RaftContext::open(
        args.id,
        config,
        Arc::new(transport::TcpTransport::new()),
        machine::KvStore::default(),
    )?;

    let listener = TcpListener::bind(&args.listen).await?;
    info!(
        "member {} listening on {} ({} cluster members)",
        args.id,
        args.listen,
        args.members.len()
    );

    let server = tokio::spawn(run_server(listener, handle.clone()));

    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping member {}", args.id);
    server.abort();
    handle.close().await?;
    Ok(())
}

/// Accept loop: one task per connection.
async fn run_server(listener: TcpListener, handle: RaftHandle) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("connection from {addr}");
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, handle).await {
                        warn!("connection {addr}: {e}");
                    }
                    debug!("connection closed: {addr}");
                });
            }
            Err(e) => error!("accept failed: {e}"),
        }
    }
}

/// Serve framed requests from one connection until it closes.
async fn handle_connection(mut socket: TcpStream, handle: RaftHandle) -> std::io::Result<()> {
    loop {
        let (correlation, request) = match frame::read_request_async(&mut socket).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };

        let response = match handle.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                // The context is gone; nothing sensible left to answer.
                warn!("request dropped: {e}");
                break;
            }
        };
        frame::write_response_async(&mut socket, correlation, &response).await?;
    }
    Ok(())
}
