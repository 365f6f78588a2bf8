//! The per-node Raft context: one task owning all mutable state.
//!
//! Every external stimulus (an inbound RPC, a transport completion, a
//! timer, a local submit) arrives as a [`Message`] on the context's queue
//! and is handled on the context task. Ownership is the single-threaded
//! executor discipline: no other task can reach the state, so completions
//! re-dispatch here instead of mutating from transport threads.

use crate::membership::Members;
use crate::meta::{MetaStore, NodeMeta};
use crate::role::{FollowerState, Role, RoleKind};
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use common::{Config, Error, Index, Member, MemberId, MemberType, Result, Term};
use log::{debug, error, info, warn};
use protocol::{
    AppendResponse, Operation, PollResponse, Request, Response, SyncResponse, VoteResponse,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::{EntryKind, SegmentedLog};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

/// Far-future deadline for timers that are not currently armed.
const IDLE: Duration = Duration::from_secs(3600);

/// Everything that can reach the context task.
pub(crate) enum Message {
    Rpc {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Submit {
        operation: Operation,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Reconfigure {
        members: Vec<Member>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    AppendOutcome {
        peer: MemberId,
        term: Term,
        up_to: Index,
        round: u64,
        result: Result<AppendResponse>,
    },
    VoteOutcome {
        peer: MemberId,
        term: Term,
        result: Result<VoteResponse>,
    },
    PollOutcome {
        peer: MemberId,
        term: Term,
        result: Result<PollResponse>,
    },
    SyncOutcome {
        peer: MemberId,
        commit_hint: Index,
        result: Result<SyncResponse>,
    },
    Report {
        reply: oneshot::Sender<NodeReport>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A point-in-time snapshot of a node's consensus state.
#[derive(Clone, Debug)]
pub struct NodeReport {
    pub id: MemberId,
    pub role: RoleKind,
    pub term: Term,
    pub leader: Option<MemberId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_index: Index,
    pub members: Vec<Member>,
}

/// Handle to a running Raft context.
///
/// Cloneable and cheap; every method enqueues a message and awaits its
/// completion on the context task.
#[derive(Clone, Debug)]
pub struct RaftHandle {
    id: MemberId,
    tx: mpsc::UnboundedSender<Message>,
}

impl RaftHandle {
    pub fn id(&self) -> MemberId {
        self.id
    }

    fn closed() -> Error {
        Error::Transport("raft context closed".into())
    }

    /// Deliver an inbound request, as a transport server does.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Rpc { request, reply })
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())
    }

    /// Submit an operation locally and await its result.
    pub async fn submit(&self, operation: Operation) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Submit { operation, reply })
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?
    }

    /// Replicate a membership view change through the log.
    pub async fn reconfigure(&self, members: Vec<Member>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Reconfigure { members, reply })
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())?.map(|_| ())
    }

    /// Snapshot the node's consensus state.
    pub async fn report(&self) -> Result<NodeReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Report { reply })
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())
    }

    /// Shut the context down, flushing the log.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Close { reply })
            .map_err(|_| Self::closed())?;
        rx.await.map_err(|_| Self::closed())
    }
}

/// The per-node state object.
pub struct RaftContext<SM: StateMachine> {
    pub(crate) id: MemberId,
    pub(crate) config: Config,
    pub(crate) log: SegmentedLog,
    pub(crate) meta: MetaStore,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<MemberId>,
    pub(crate) leader: Option<MemberId>,
    pub(crate) last_applied: Index,
    pub(crate) members: Members,
    pub(crate) role: Role,
    pub(crate) state_machine: SM,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tx: mpsc::UnboundedSender<Message>,
    pub(crate) election_deadline: Instant,
    pub(crate) heartbeat_deadline: Instant,
    pub(crate) sync_deadline: Instant,
    /// Submit futures parked per index, answered in commit order.
    pub(crate) waiters: BTreeMap<Index, oneshot::Sender<Result<Vec<u8>>>>,
    pub(crate) rng: StdRng,
}

impl<SM: StateMachine> RaftContext<SM> {
    /// Open the log, recover persistent state, and spawn the context task.
    ///
    /// The node starts in the Start role and immediately transitions to
    /// Follower (or Passive, per `config.member_type`).
    pub fn open(
        id: MemberId,
        config: Config,
        transport: Arc<dyn Transport>,
        state_machine: SM,
    ) -> Result<RaftHandle> {
        config.validate()?;
        let local = config
            .members
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::Config(format!("member {id} is not in the seed membership")))?;
        if local.member_type != config.member_type {
            return Err(Error::Config(format!(
                "member {id} is seeded as {:?} but configured as {:?}",
                local.member_type, config.member_type
            )));
        }
        if config.member_type == MemberType::Remote {
            return Err(Error::Config(
                "remote members do not run a raft context".into(),
            ));
        }

        let log = SegmentedLog::open(&config)?;
        let meta = MetaStore::new(&config.directory, &config.name);
        let NodeMeta { term, voted_for } = meta.load()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut ctx = Self {
            id,
            members: Members::new(&config.members),
            term,
            voted_for,
            leader: None,
            last_applied: 0,
            role: Role::Start,
            state_machine,
            transport,
            tx: tx.clone(),
            election_deadline: now + IDLE,
            heartbeat_deadline: now + IDLE,
            sync_deadline: now + config.heartbeat_interval,
            waiters: BTreeMap::new(),
            rng: StdRng::from_entropy(),
            log,
            meta,
            config,
        };

        match ctx.config.member_type {
            MemberType::Passive => {
                ctx.role = Role::Passive;
                info!("member {id} opened as passive in term {}", ctx.term);
            }
            _ => {
                ctx.role = Role::Follower(FollowerState::default());
                ctx.reset_election_timer();
                info!("member {id} opened as follower in term {}", ctx.term);
            }
        }

        tokio::spawn(ctx.run(rx));
        Ok(RaftHandle { id, tx })
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        // Re-apply the durable committed prefix to the state machine.
        if let Err(e) = self.apply_committed() {
            error!("member {}: recovery apply failed: {e}", self.id);
            if e.is_fatal() {
                let _ = self.log.close();
                return;
            }
        }

        loop {
            let deadline = self.next_deadline();
            let outcome = tokio::select! {
                maybe = rx.recv() => match maybe {
                    None => break,
                    Some(Message::Close { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(message) => self.handle_message(message),
                },
                _ = tokio::time::sleep_until(deadline) => self.handle_tick(),
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    // Storage corruption tears the context down; everything
                    // else recovers in-protocol.
                    error!("member {}: fatal error, closing context: {e}", self.id);
                    break;
                }
                warn!("member {}: {e}", self.id);
            }
        }

        self.fail_waiters();
        if let Err(e) = self.log.close() {
            warn!("member {}: log close failed: {e}", self.id);
        }
        debug!("member {} context stopped", self.id);
    }

    fn handle_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Rpc { request, reply } => self.handle_rpc(request, reply),
            Message::Submit { operation, reply } => self.handle_submit(operation, reply),
            Message::Reconfigure { members, reply } => self.handle_reconfigure(members, reply),
            Message::AppendOutcome {
                peer,
                term,
                up_to,
                round,
                result,
            } => self.on_append_outcome(peer, term, up_to, round, result),
            Message::VoteOutcome { peer, term, result } => self.on_vote_outcome(peer, term, result),
            Message::PollOutcome { peer, term, result } => self.on_poll_outcome(peer, term, result),
            Message::SyncOutcome {
                peer,
                commit_hint,
                result,
            } => self.on_sync_outcome(peer, commit_hint, result),
            Message::Report { reply } => {
                let _ = reply.send(self.report());
                Ok(())
            }
            Message::Close { .. } => Ok(()),
        }
    }

    fn handle_tick(&mut self) -> Result<()> {
        let now = Instant::now();
        match self.role {
            Role::Follower(_) | Role::Candidate(_) => {
                if now >= self.election_deadline {
                    self.on_election_timeout()?;
                }
            }
            Role::Leader(_) => {
                if now >= self.heartbeat_deadline {
                    self.heartbeat_deadline = now + self.config.heartbeat_interval;
                    self.broadcast_append()?;
                }
            }
            Role::Start | Role::Passive => {}
        }

        if now >= self.sync_deadline {
            self.sync_deadline = now + self.config.heartbeat_interval;
            self.run_sync_round()?;
        }
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.sync_deadline;
        match self.role {
            Role::Follower(_) | Role::Candidate(_) => {
                deadline = deadline.min(self.election_deadline);
            }
            Role::Leader(_) => {
                deadline = deadline.min(self.heartbeat_deadline);
            }
            Role::Start | Role::Passive => {}
        }
        deadline
    }

    pub(crate) fn report(&self) -> NodeReport {
        NodeReport {
            id: self.id,
            role: self.role.kind(),
            term: self.term,
            leader: self.leader,
            commit_index: self.log.commit_index(),
            last_applied: self.last_applied,
            last_index: self.log.last_index(),
            members: self.members.all(),
        }
    }

    /// Arm the election timer: uniform in `[T, 2T)`.
    pub(crate) fn reset_election_timer(&mut self) {
        let base = self.config.election_timeout;
        let jitter = self.rng.gen_range(0..base.as_millis().max(1) as u64);
        self.election_deadline = Instant::now() + base + Duration::from_millis(jitter);
    }

    /// Persist `{term, voted_for}`; must complete before any vote response
    /// leaves the node.
    pub(crate) fn persist_meta(&self) -> Result<()> {
        self.meta.save(&NodeMeta {
            term: self.term,
            voted_for: self.voted_for,
        })
    }

    /// Adopt a higher term, clearing the vote and leader.
    pub(crate) fn adopt_term(&mut self, term: Term) -> Result<()> {
        if term > self.term {
            debug!("member {}: adopting term {term} (was {})", self.id, self.term);
            self.term = term;
            self.voted_for = None;
            self.leader = None;
            self.persist_meta()?;
        }
        Ok(())
    }

    /// Fall back to Follower (passive members stay passive), failing any
    /// leader obligations.
    pub(crate) fn step_down(&mut self, term: Term) -> Result<()> {
        self.adopt_term(term)?;
        if matches!(self.role, Role::Passive | Role::Start) {
            return Ok(());
        }
        let old = std::mem::replace(&mut self.role, Role::Follower(FollowerState::default()));
        if let Role::Leader(state) = old {
            info!(
                "member {}: stepping down from leader in term {}",
                self.id, self.term
            );
            for read in state.pending_reads {
                let _ = read.reply.send(Err(Error::NoLeader {
                    leader: self.leader,
                }));
            }
            self.fail_waiters();
        }
        self.reset_election_timer();
        Ok(())
    }

    /// Fail every parked submit with a no-leader error.
    pub(crate) fn fail_waiters(&mut self) {
        let leader = self.leader;
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.send(Err(Error::NoLeader { leader }));
        }
    }

    /// Advance the commit watermark and push newly committed entries through
    /// the apply pipeline.
    pub(crate) fn commit_to(&mut self, target: Index) -> Result<()> {
        let clamped = target.min(self.log.last_index());
        if clamped > self.log.commit_index() {
            self.log.commit(clamped)?;
        }
        self.apply_committed()
    }

    /// Apply committed entries in strict index order, answering parked
    /// submits as their indexes come up.
    pub(crate) fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.log.commit_index() {
            let index = self.last_applied + 1;
            let outcome = match self.log.get(index)? {
                // A skipped or compacted-away offset has nothing to apply.
                None => Ok(Vec::new()),
                Some(entry) => match entry.kind {
                    EntryKind::NoOp => Ok(Vec::new()),
                    EntryKind::Command => self.state_machine.apply(&entry).map_err(|e| {
                        warn!("member {}: apply of index {index} failed: {e}", self.id);
                        Error::Application(e.to_string())
                    }),
                    EntryKind::Configuration => {
                        self.apply_configuration(&entry.payload);
                        Ok(Vec::new())
                    }
                },
            };
            self.last_applied = index;
            if let Some(waiter) = self.waiters.remove(&index) {
                let _ = waiter.send(outcome);
            }
        }

        self.members
            .record_local_progress(self.id, self.log.commit_index(), 0);
        Ok(())
    }

    fn apply_configuration(&mut self, payload: &[u8]) {
        match bincode::serde::decode_from_slice::<Vec<Member>, _>(
            payload,
            bincode::config::standard(),
        ) {
            Ok((members, _)) => {
                info!(
                    "member {}: applying membership change with {} members",
                    self.id,
                    members.len()
                );
                self.members.merge(&members);
            }
            Err(e) => warn!("member {}: undecodable configuration entry: {e}", self.id),
        }
    }

    /// Fire a request at a peer from a transport task, wrapping its outcome
    /// back into the context queue.
    pub(crate) fn spawn_send<F>(&self, member: Member, request: Request, wrap: F)
    where
        F: FnOnce(Result<Response>) -> Message + Send + 'static,
    {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = transport.send(&member, request).await;
            let _ = tx.send(wrap(result));
        });
    }

    /// Term of the last present entry, scanning past trailing skipped
    /// offsets.
    pub(crate) fn last_log_term(&self) -> Result<Term> {
        let mut index = self.log.last_index();
        while index >= self.log.first_index() && index > 0 {
            if let Some(term) = self.log.term_of(index)? {
                return Ok(term);
            }
            index -= 1;
        }
        Ok(0)
    }
}
