//! Raft consensus over the segmented log.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Member Node                            │
//! │  ┌────────────┐      ┌──────────────┐      ┌──────────────────┐  │
//! │  │ Transport  │─────▶│ RaftContext  │─────▶│  SegmentedLog    │  │
//! │  │ (inbound)  │      │ (one task)   │      │  (storage crate) │  │
//! │  └────────────┘      └──────┬───────┘      └──────────────────┘  │
//! │                             │                                    │
//! │              ┌──────────────┼─────────────────┐                  │
//! │              ▼              ▼                 ▼                  │
//! │      ┌──────────────┐ ┌───────────┐  ┌────────────────┐          │
//! │      │ Role slot    │ │ Commit /  │  │ StateMachine   │          │
//! │      │ (follower,   │ │ apply     │  │ (user callback)│          │
//! │      │  candidate,  │ │ pipeline  │  └────────────────┘          │
//! │      │  leader,     │ └───────────┘                              │
//! │      │  passive)    │                                            │
//! │      └──────────────┘                                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The context is an actor: one tokio task owns every piece of mutable
//! state, and RPCs, timer ticks, transport completions, and local submits
//! all arrive as messages on its queue. That task-per-context ownership is
//! the single-threaded executor discipline: there is no lock to forget and
//! no thread to assert, because no other thread can reach the state.
//!
//! # Roles
//!
//! ```text
//! Start ──open()──▶ Follower ──pre-vote quorum──▶ Candidate
//!                     ▲                              │
//!                     │                              ├─ vote quorum ──▶ Leader
//!                     └──── higher term seen ────────┘   (also Leader ▶ Follower)
//! ```
//!
//! Passive members sit outside the election graph entirely: they reject
//! Append/Vote/Poll and learn committed entries through the gossip tier.
//!
//! # Modules
//!
//! - [`context`]: the actor, its message queue, and the public handle
//! - [`rpc`]: per-role handlers for the six wire RPCs and elections
//! - [`replication`]: the leader's per-peer drivers and the commit engine
//! - [`gossip`]: the passive-member sync tier
//! - [`membership`]: the copy-on-write membership view
//! - [`meta`]: durable `{term, voted_for}` state
//! - [`state_machine`], [`transport`]: the user-facing seams

pub mod context;
pub mod gossip;
pub mod membership;
pub mod meta;
pub mod replication;
pub mod role;
pub mod rpc;
pub mod state_machine;
pub mod transport;

pub use context::{NodeReport, RaftContext, RaftHandle};
pub use membership::Members;
pub use meta::{MetaStore, NodeMeta};
pub use role::RoleKind;
pub use state_machine::StateMachine;
pub use transport::Transport;
