//! Role state carried by the context's replaceable role slot.

use common::{Index, MemberId, Result, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// The externally visible role of a member.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    Start,
    Follower,
    Candidate,
    Leader,
    Passive,
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Start => "start",
            RoleKind::Follower => "follower",
            RoleKind::Candidate => "candidate",
            RoleKind::Leader => "leader",
            RoleKind::Passive => "passive",
        };
        write!(f, "{name}")
    }
}

/// A pre-vote round run by a follower before it risks a real election.
#[derive(Debug)]
pub(crate) struct PreVote {
    /// The term the election would use.
    pub term: Term,
    /// Members that would grant a vote, ourselves included.
    pub grants: HashSet<MemberId>,
}

#[derive(Debug, Default)]
pub(crate) struct FollowerState {
    pub pre_vote: Option<PreVote>,
}

#[derive(Debug)]
pub(crate) struct CandidateState {
    /// Votes granted in the candidate's term, ourselves included.
    pub votes: HashSet<MemberId>,
}

/// Per-peer replication driver state.
#[derive(Debug)]
pub(crate) enum DriverState {
    Idle,
    InFlight,
    Backoff { until: Instant },
}

#[derive(Debug)]
pub(crate) struct PeerState {
    /// Next index to send this peer.
    pub next_index: Index,
    /// Highest index known replicated on this peer.
    pub match_index: Index,
    pub driver: DriverState,
    /// Current backoff delay, doubled per failure up to the heartbeat
    /// interval.
    pub backoff: Duration,
    /// Highest heartbeat round this peer has acknowledged.
    pub acked_round: u64,
}

impl PeerState {
    pub fn new(next_index: Index) -> Self {
        Self {
            next_index,
            match_index: 0,
            driver: DriverState::Idle,
            backoff: Duration::from_millis(0),
            acked_round: 0,
        }
    }
}

/// A linearizable read parked until a quorum acknowledges a fresh heartbeat
/// round.
pub(crate) struct PendingRead {
    pub required_round: u64,
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Result<Vec<u8>>>,
}

pub(crate) struct LeaderState {
    pub peers: HashMap<MemberId, PeerState>,
    /// Heartbeat round counter; bumped on every broadcast.
    pub round: u64,
    /// When a quorum last acknowledged a round, for the leader lease.
    pub last_quorum_contact: Instant,
    pub pending_reads: Vec<PendingRead>,
}

impl LeaderState {
    pub fn new(peer_ids: impl Iterator<Item = MemberId>, next_index: Index) -> Self {
        Self {
            peers: peer_ids.map(|id| (id, PeerState::new(next_index))).collect(),
            round: 0,
            last_quorum_contact: Instant::now(),
            pending_reads: Vec::new(),
        }
    }
}

/// The replaceable role slot.
pub(crate) enum Role {
    Start,
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Passive,
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Start => RoleKind::Start,
            Role::Follower(_) => RoleKind::Follower,
            Role::Candidate(_) => RoleKind::Candidate,
            Role::Leader(_) => RoleKind::Leader,
            Role::Passive => RoleKind::Passive,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }
}
