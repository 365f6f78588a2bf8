
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Identifier for a member of the Raft cluster.
/// Examples:
/// - `let local: MemberId = 1;`
/// - `let peer: MemberId = 3;`
pub type MemberId = u32;

/// A 1-based position in the replicated log. 0 indicates no index.
pub type Index = u64;

/// A monotonically increasing logical epoch. At most one leader per term.
pub type Term = u64;

/// How a member participates in the cluster.
///
/// Active members vote and count towards quorum. Passive members never vote
/// and learn committed state through gossip. Remote members are clients that
/// hold no log at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberType {
    Active,
    Passive,
    Remote,
}

/// A member record as tracked by the membership view and gossiped between
/// nodes. Records are merged last-writer-wins by `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub member_type: MemberType,
    pub address: String,
    /// Highest index this member is known to have committed.
    pub commit_index: Index,
    /// Highest index this member has recycled through compaction.
    pub recycle_index: Index,
    /// Bumped by the owning member on every local change.
    pub version: u64,
}

impl Member {
    /// Create a fresh member record, as used for seed configuration.
    pub fn new(id: MemberId, address: impl Into<String>, member_type: MemberType) -> Self {
        Self {
            id,
            member_type,
            address: address.into(),
            commit_index: 0,
            recycle_index: 0,
            version: 0,
        }
    }

    pub fn is_voting(&self) -> bool {
        self.member_type == MemberType::Active
    }
}

/// Canonical error type shared across all subsystems.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config: {0}")]
    Config(String),
    #[error("buffer: {0}")]
    Buffer(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("illegal member state: {0}")]
    IllegalMemberState(String),
    #[error("no leader")]
    NoLeader { leader: Option<MemberId> },
    #[error("application: {0}")]
    Application(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is fatal to the Raft context. Storage corruption
    /// tears the context down; everything else is recoverable in-protocol.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

/// Result alias that carries an `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime configuration for a Raft node and its segmented log.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .directory(PathBuf::from("./node1"))
///     .name("node1".to_string())
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Root path for segment files and node metadata.
    #[builder(default = PathBuf::from("./copycat_data"))]
    pub directory: PathBuf,
    /// Log name, used as the segment filename prefix.
    #[builder(default = String::from("copycat"))]
    pub name: String,
    /// Hard cap on a single entry record, in bytes.
    #[builder(default = 1024 * 1024)]
    pub max_entry_size: usize,
    /// Soft cap on segment size before rotation, in bytes.
    #[builder(default = 32 * 1024 * 1024)]
    pub max_segment_size: usize,
    /// Cap on the number of offsets a segment index may hold.
    #[builder(default = 1024 * 1024)]
    pub max_entries_per_segment: usize,
    /// Base election timeout `T`; the actual timeout is uniform in `[T, 2T)`.
    #[builder(default = Duration::from_millis(500))]
    pub election_timeout: Duration,
    /// Leader heartbeat period, also the gossip period. Must be shorter than
    /// half the election timeout.
    #[builder(default = Duration::from_millis(150))]
    pub heartbeat_interval: Duration,
    /// Seed cluster membership, including the local member.
    #[builder(default)]
    pub members: Vec<Member>,
    /// How the local member participates in the cluster.
    #[builder(default = MemberType::Active)]
    pub member_type: MemberType,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./copycat_data"),
            name: String::from("copycat"),
            max_entry_size: 1024 * 1024,
            max_segment_size: 32 * 1024 * 1024,
            max_entries_per_segment: 1024 * 1024,
            election_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(150),
            members: Vec::new(),
            member_type: MemberType::Active,
        }
    }
}

impl Config {
    /// Check internal consistency of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("log name must not be empty".into()));
        }
        if self.max_entry_size == 0 {
            return Err(Error::Config("max_entry_size must be > 0".into()));
        }
        if self.max_entry_size > self.max_segment_size {
            return Err(Error::Config(format!(
                "max_entry_size {} exceeds max_segment_size {}",
                self.max_entry_size, self.max_segment_size
            )));
        }
        if self.max_entries_per_segment == 0 {
            return Err(Error::Config("max_entries_per_segment must be > 0".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat_interval must be > 0".into()));
        }
        if self.heartbeat_interval * 2 >= self.election_timeout {
            return Err(Error::Config(format!(
                "heartbeat_interval {:?} must be shorter than half the election timeout {:?}",
                self.heartbeat_interval, self.election_timeout
            )));
        }
        Ok(())
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{Config, Error, Index, Member, MemberId, MemberType, Result, Term};
}
