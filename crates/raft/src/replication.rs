//! The leader's replication driver and commit engine.
//!
//! Each peer has a small driver state machine `{Idle, InFlight, Backoff}`
//! with at most one append RPC in flight. Batches cap at 1 MiB or a fixed
//! entry count. Transport failures back off exponentially up to the
//! heartbeat interval and re-send on the next tick. Commit advancement runs
//! after every successful match-index update; waiters are notified strictly
//! in index order by the apply pipeline.

use crate::context::{Message, RaftContext};
use crate::role::{DriverState, LeaderState, PendingRead, Role};
use crate::rpc::expect_append;
use crate::state_machine::StateMachine;
use common::{Error, Index, MemberId, Result, Term};
use log::{debug, info};
use protocol::{AppendRequest, AppendResponse, ErrorKind, Request};
use storage::EntryKind;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Largest append batch in bytes.
const MAX_BATCH_BYTES: usize = 1024 * 1024;
/// Largest append batch in entries.
const MAX_BATCH_ENTRIES: usize = 1024;
/// First backoff step after a transport failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

impl<SM: StateMachine> RaftContext<SM> {
    /// Take leadership of the current term: initialize per-peer drivers,
    /// append the no-op that commits prior-term entries, and start the
    /// heartbeat.
    pub(crate) fn become_leader(&mut self) -> Result<()> {
        info!(
            "member {}: won election, leading term {}",
            self.id, self.term
        );
        let next_index = self.log.next_index();
        let peer_ids: Vec<MemberId> = self
            .members
            .voting()
            .filter(|m| m.id != self.id)
            .map(|m| m.id)
            .collect();
        self.role = Role::Leader(LeaderState::new(peer_ids.into_iter(), next_index));
        self.leader = Some(self.id);
        self.heartbeat_deadline = Instant::now() + self.config.heartbeat_interval;

        self.log
            .append(self.term, EntryKind::NoOp, Vec::new(), Vec::new())?;
        self.log.sync()?;
        self.advance_commit()?;
        self.broadcast_append()
    }

    /// One heartbeat round: bump the round counter and drive every peer.
    pub(crate) fn broadcast_append(&mut self) -> Result<()> {
        let peers: Vec<MemberId> = match &mut self.role {
            Role::Leader(state) => {
                state.round += 1;
                state.peers.keys().copied().collect()
            }
            _ => return Ok(()),
        };
        for peer in peers {
            self.drive_peer(peer)?;
        }
        self.refresh_quorum_state();
        Ok(())
    }

    /// Send this peer its next batch, unless one is already in flight or the
    /// peer is backing off.
    pub(crate) fn drive_peer(&mut self, peer: MemberId) -> Result<()> {
        let (next_index, round) = {
            let Role::Leader(state) = &self.role else {
                return Ok(());
            };
            let Some(ps) = state.peers.get(&peer) else {
                return Ok(());
            };
            match ps.driver {
                DriverState::InFlight => return Ok(()),
                DriverState::Backoff { until } if Instant::now() < until => return Ok(()),
                _ => {}
            }
            (ps.next_index, state.round)
        };

        let prev_log_index = next_index - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.log.term_of(prev_log_index)?.unwrap_or(0)
        };
        let entries = self.log.entries(
            next_index,
            self.log.last_index(),
            MAX_BATCH_BYTES,
            MAX_BATCH_ENTRIES,
        )?;
        let up_to = entries.last().map(|e| e.index).unwrap_or(prev_log_index);

        let Some(member) = self.members.get(peer).cloned() else {
            return Ok(());
        };
        let request = Request::Append(AppendRequest {
            term: self.term,
            leader: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index: self.log.commit_index(),
        });

        if let Role::Leader(state) = &mut self.role {
            if let Some(ps) = state.peers.get_mut(&peer) {
                ps.driver = DriverState::InFlight;
            }
        }

        let term = self.term;
        self.spawn_send(member, request, move |result| Message::AppendOutcome {
            peer,
            term,
            up_to,
            round,
            result: result.and_then(expect_append),
        });
        Ok(())
    }

    /// Completion of an append RPC to one peer.
    pub(crate) fn on_append_outcome(
        &mut self,
        peer: MemberId,
        sent_term: Term,
        up_to: Index,
        round: u64,
        result: Result<AppendResponse>,
    ) -> Result<()> {
        if sent_term != self.term || !self.role.is_leader() {
            return Ok(());
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("member {}: append to {peer} failed: {e}", self.id);
                self.back_off(peer);
                return Ok(());
            }
        };
        if response.term > self.term {
            return self.step_down(response.term);
        }
        if response.error == Some(ErrorKind::IllegalMemberState) {
            // The peer cannot serve appends in its current role; retry on a
            // later heartbeat once gossip refreshes the view.
            self.back_off(peer);
            return Ok(());
        }

        let mut continue_drive = false;
        if let Role::Leader(state) = &mut self.role {
            if let Some(ps) = state.peers.get_mut(&peer) {
                ps.driver = DriverState::Idle;
                ps.backoff = Duration::ZERO;
                if response.succeeded {
                    ps.match_index = ps.match_index.max(up_to);
                    ps.next_index = ps.next_index.max(up_to + 1);
                    ps.acked_round = ps.acked_round.max(round);
                    continue_drive = true;
                } else {
                    // Log-matching failed; back the peer's next index up and
                    // retry immediately.
                    let hint = response.log_index + 1;
                    ps.next_index = ps.next_index.saturating_sub(1).min(hint).max(1);
                    debug!(
                        "member {}: backtracking peer {peer} to index {}",
                        self.id, ps.next_index
                    );
                    continue_drive = true;
                }
            }
        }

        self.refresh_quorum_state();
        if response.succeeded {
            self.advance_commit()?;
        }

        if continue_drive {
            let behind = match &self.role {
                Role::Leader(state) => state
                    .peers
                    .get(&peer)
                    .is_some_and(|ps| ps.next_index <= self.log.last_index()),
                _ => false,
            };
            if behind || !response.succeeded {
                self.drive_peer(peer)?;
            }
        }
        Ok(())
    }

    fn back_off(&mut self, peer: MemberId) {
        let cap = self.config.heartbeat_interval;
        if let Role::Leader(state) = &mut self.role {
            if let Some(ps) = state.peers.get_mut(&peer) {
                ps.backoff = if ps.backoff.is_zero() {
                    INITIAL_BACKOFF
                } else {
                    (ps.backoff * 2).min(cap)
                };
                ps.driver = DriverState::Backoff {
                    until: Instant::now() + ps.backoff,
                };
            }
        }
    }

    /// Advance the commit index to the highest quorum-replicated index whose
    /// entry carries the current term.
    pub(crate) fn advance_commit(&mut self) -> Result<()> {
        let candidate = {
            let Role::Leader(state) = &self.role else {
                return Ok(());
            };
            let mut matches: Vec<Index> = state.peers.values().map(|p| p.match_index).collect();
            matches.push(self.log.last_index());
            matches.sort_unstable_by(|a, b| b.cmp(a));
            let quorum = self.members.quorum();
            if matches.len() < quorum {
                return Ok(());
            }
            matches[quorum - 1]
        };
        if candidate <= self.log.commit_index() {
            return Ok(());
        }

        // Walk down past skipped offsets to the nearest present entry; only
        // an entry of the current term proves the quorum is current.
        let mut probe = candidate;
        while probe > self.log.commit_index() {
            match self.log.term_of(probe)? {
                Some(term) => {
                    if term == self.term {
                        self.commit_to(candidate)?;
                    }
                    break;
                }
                None => probe -= 1,
            }
        }
        Ok(())
    }

    /// Park a linearizable read behind a fresh heartbeat round.
    pub(crate) fn queue_linearizable_read(
        &mut self,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        {
            let Role::Leader(state) = &mut self.role else {
                let _ = reply.send(Err(Error::NoLeader {
                    leader: self.leader,
                }));
                return Ok(());
            };
            state.pending_reads.push(PendingRead {
                required_round: state.round + 1,
                payload,
                reply,
            });
        }
        // The broadcast bumps the round to the one the read requires.
        self.broadcast_append()
    }

    /// Recompute the quorum-acknowledged round: refresh the leader lease and
    /// answer any reads whose round has been confirmed.
    pub(crate) fn refresh_quorum_state(&mut self) {
        let quorum = self.members.quorum();
        let ready: Vec<PendingRead> = {
            let Role::Leader(state) = &mut self.role else {
                return;
            };
            let mut rounds: Vec<u64> = state.peers.values().map(|p| p.acked_round).collect();
            rounds.push(state.round); // ourselves
            rounds.sort_unstable_by(|a, b| b.cmp(a));
            if rounds.len() < quorum {
                return;
            }
            let acked = rounds[quorum - 1];
            if acked >= state.round {
                state.last_quorum_contact = Instant::now();
            }
            if !state.pending_reads.iter().any(|r| r.required_round <= acked) {
                return;
            }
            let parked = std::mem::take(&mut state.pending_reads);
            let (ready, keep) = parked
                .into_iter()
                .partition(|r| r.required_round <= acked);
            state.pending_reads = keep;
            ready
        };
        for read in ready {
            let _ = read.reply.send(self.state_machine.query(&read.payload));
        }
    }
}
