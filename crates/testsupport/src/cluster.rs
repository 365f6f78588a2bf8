//! In-memory cluster harness: spawns Raft contexts wired together by a
//! local transport, with partition injection and node restarts.
//!
//! Nodes get staggered election timeouts (node 1 shortest), so the first
//! election is deterministic while the cluster is healthy.

use crate::fixtures::init_logging;
use crate::kv::{KvHandle, KvStateMachine};
use async_trait::async_trait;
use common::{Config, Error, Member, MemberId, MemberType, Result};
use raft::{NodeReport, RaftContext, RaftHandle, RoleKind, Transport};
use protocol::{Consistency, Operation, Request, Response};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

type Registry = Arc<Mutex<HashMap<MemberId, RaftHandle>>>;
type Partitioned = Arc<Mutex<HashSet<MemberId>>>;

const HEARTBEAT: Duration = Duration::from_millis(50);
const BASE_ELECTION: u64 = 150;
const ELECTION_STAGGER: u64 = 250;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A transport for single-node contexts: there is no one to talk to, so
/// every send fails as unreachable.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send(&self, to: &Member, _request: Request) -> Result<Response> {
        Err(Error::Transport(format!("no route to member {}", to.id)))
    }
}

/// Delivers requests by calling the target node's handle directly.
pub struct LocalTransport {
    from: MemberId,
    registry: Registry,
    partitioned: Partitioned,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: &Member, request: Request) -> Result<Response> {
        {
            let partitioned = self.partitioned.lock().expect("partition set poisoned");
            if partitioned.contains(&self.from) || partitioned.contains(&to.id) {
                return Err(Error::Transport(format!(
                    "partitioned: {} -> {}",
                    self.from, to.id
                )));
            }
        }
        let handle = {
            let registry = self.registry.lock().expect("registry poisoned");
            registry.get(&to.id).cloned()
        }
        .ok_or_else(|| Error::Transport(format!("unknown member {}", to.id)))?;
        handle.handle(request).await
    }
}

struct TestNode {
    id: MemberId,
    member_type: MemberType,
    dir: TempDir,
    handle: RaftHandle,
    kv: KvHandle,
}

/// A running cluster of in-process Raft nodes.
pub struct TestCluster {
    nodes: Vec<TestNode>,
    members: Vec<Member>,
    registry: Registry,
    partitioned: Partitioned,
}

impl TestCluster {
    /// Spawn `active` voting nodes (ids 1..=active) and `passive` gossip
    /// nodes after them.
    pub fn spawn(active: usize, passive: usize) -> Result<Self> {
        init_logging();
        let mut members = Vec::new();
        for i in 0..active + passive {
            let id = (i + 1) as MemberId;
            let member_type = if i < active {
                MemberType::Active
            } else {
                MemberType::Passive
            };
            members.push(Member::new(id, format!("mem://{id}"), member_type));
        }

        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let partitioned: Partitioned = Arc::new(Mutex::new(HashSet::new()));

        let mut cluster = Self {
            nodes: Vec::new(),
            members,
            registry,
            partitioned,
        };
        for i in 0..active + passive {
            let id = (i + 1) as MemberId;
            let member_type = cluster.members[i].member_type;
            let dir = TempDir::new()?;
            let node = cluster.spawn_node(id, member_type, dir)?;
            cluster.nodes.push(node);
        }
        Ok(cluster)
    }

    fn spawn_node(&self, id: MemberId, member_type: MemberType, dir: TempDir) -> Result<TestNode> {
        let election =
            Duration::from_millis(BASE_ELECTION + ELECTION_STAGGER * (u64::from(id) - 1));
        let config = Config::builder()
            .directory(dir.path().to_path_buf())
            .name(format!("node-{id}"))
            .max_entry_size(64 * 1024)
            .max_segment_size(1024 * 1024)
            .max_entries_per_segment(1024)
            .election_timeout(election)
            .heartbeat_interval(HEARTBEAT)
            .members(self.members.clone())
            .member_type(member_type)
            .build();

        let transport = Arc::new(LocalTransport {
            from: id,
            registry: Arc::clone(&self.registry),
            partitioned: Arc::clone(&self.partitioned),
        });
        let (state_machine, kv) = KvStateMachine::new();
        let handle = RaftContext::open(id, config, transport, state_machine)?;
        self.registry
            .lock()
            .expect("registry poisoned")
            .insert(id, handle.clone());
        Ok(TestNode {
            id,
            member_type,
            dir,
            handle,
            kv,
        })
    }

    pub fn ids(&self) -> Vec<MemberId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub fn handle(&self, id: MemberId) -> RaftHandle {
        self.node(id).handle.clone()
    }

    pub fn kv(&self, id: MemberId) -> KvHandle {
        self.node(id).kv.clone()
    }

    fn node(&self, id: MemberId) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no node {id} in the cluster"))
    }

    /// Cut a node off from everyone, both directions.
    pub fn disconnect(&self, id: MemberId) {
        self.partitioned
            .lock()
            .expect("partition set poisoned")
            .insert(id);
    }

    /// Heal a node's partition.
    pub fn reconnect(&self, id: MemberId) {
        self.partitioned
            .lock()
            .expect("partition set poisoned")
            .remove(&id);
    }

    /// Snapshot every node's consensus state.
    pub async fn reports(&self) -> Result<Vec<NodeReport>> {
        let mut reports = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            reports.push(node.handle.report().await?);
        }
        Ok(reports)
    }

    /// Poll until `condition` holds over the node reports.
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> Result<Vec<NodeReport>>
    where
        F: Fn(&[NodeReport]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let reports = self.reports().await?;
            if condition(&reports) {
                return Ok(reports);
            }
            if Instant::now() >= deadline {
                return Err(Error::Transport(format!(
                    "condition not reached within {timeout:?}: {reports:?}"
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for some node to win an election; returns the leader of the
    /// highest term.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<MemberId> {
        let reports = self
            .wait_until(timeout, |reports| {
                reports.iter().any(|r| r.role == RoleKind::Leader)
            })
            .await?;
        Ok(reports
            .iter()
            .filter(|r| r.role == RoleKind::Leader)
            .max_by_key(|r| r.term)
            .map(|r| r.id)
            .expect("a leader was just observed"))
    }

    /// Submit a `key = value` command to the given node.
    pub async fn submit_set(&self, to: MemberId, key: &str, value: &str) -> Result<Vec<u8>> {
        self.handle(to)
            .submit(Operation::Command {
                key: key.as_bytes().to_vec(),
                payload: value.as_bytes().to_vec(),
            })
            .await
    }

    /// Run a query against the given node.
    pub async fn query(
        &self,
        to: MemberId,
        key: &str,
        consistency: Consistency,
    ) -> Result<Vec<u8>> {
        self.handle(to)
            .submit(Operation::Query {
                payload: key.as_bytes().to_vec(),
                consistency,
            })
            .await
    }

    /// Stop a node, keeping its directory, then reopen it over the same
    /// state.
    pub async fn restart(&mut self, id: MemberId) -> Result<()> {
        let position = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| Error::Transport(format!("no node {id} in the cluster")))?;
        let node = self.nodes.remove(position);
        node.handle.close().await?;
        self.registry
            .lock()
            .expect("registry poisoned")
            .remove(&id);

        let reopened = self.spawn_node(node.id, node.member_type, node.dir)?;
        self.nodes.insert(position, reopened);
        Ok(())
    }

    /// Shut every node down.
    pub async fn close_all(&mut self) -> Result<()> {
        for node in &self.nodes {
            node.handle.close().await?;
        }
        Ok(())
    }
}
