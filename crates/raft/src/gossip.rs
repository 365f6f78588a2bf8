//! The passive-member gossip tier.
//!
//! Every open member runs a periodic sync on the heartbeat period. Active
//! members push towards passive members (the only way a non-voting member
//! learns committed entries); passive members gossip their view to any
//! member. Each round picks up to three *distinct* random peers and sends
//! the peer's last-known commit index, the full membership view, and up to
//! 1 MiB of committed entries past that point. A peer that responds and is
//! still behind, but made progress, is synced again immediately, so a
//! lagging member converges in a handful of rounds rather than one round
//! per tick.

use crate::context::{Message, RaftContext};
use crate::role::Role;
use crate::rpc::expect_sync;
use crate::state_machine::StateMachine;
use common::{Index, Member, MemberId, MemberType, Result};
use log::debug;
use protocol::{Request, SyncRequest, SyncResponse};

/// Distinct peers contacted per gossip round.
const GOSSIP_FANOUT: usize = 3;
/// Largest entry payload carried by one sync.
const SYNC_BATCH_BYTES: usize = 1024 * 1024;
/// Largest entry count carried by one sync.
const SYNC_BATCH_ENTRIES: usize = 1024;

impl<SM: StateMachine> RaftContext<SM> {
    /// One periodic gossip round.
    pub(crate) fn run_sync_round(&mut self) -> Result<()> {
        let candidates: Vec<Member> = match self.role {
            Role::Start => return Ok(()),
            // A passive member gossips with anyone who holds a log.
            Role::Passive => self
                .members
                .iter()
                .filter(|m| m.id != self.id && m.member_type != MemberType::Remote)
                .cloned()
                .collect(),
            // Active members push towards passive members.
            _ => self
                .members
                .passive()
                .filter(|m| m.id != self.id)
                .cloned()
                .collect(),
        };
        if candidates.is_empty() {
            return Ok(());
        }

        let count = candidates.len().min(GOSSIP_FANOUT);
        let chosen = rand::seq::index::sample(&mut self.rng, candidates.len(), count);
        for i in chosen.iter() {
            self.send_sync(candidates[i].clone());
        }
        Ok(())
    }

    /// Send one sync to `target`, carrying what we believe it is missing.
    pub(crate) fn send_sync(&mut self, target: Member) {
        let peer_commit = target.commit_index;
        let entries = if self.log.commit_index() > peer_commit {
            match self.log.entries(
                peer_commit + 1,
                self.log.commit_index(),
                SYNC_BATCH_BYTES,
                SYNC_BATCH_ENTRIES,
            ) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!("member {}: sync batch read failed: {e}", self.id);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let request = Request::Sync(SyncRequest {
            term: self.term,
            leader: self.leader,
            log_index: peer_commit,
            members: self.members.all(),
            entries,
        });
        let peer_id = target.id;
        self.spawn_send(target, request, move |result| Message::SyncOutcome {
            peer: peer_id,
            commit_hint: peer_commit,
            result: result.and_then(expect_sync),
        });
    }

    /// Completion of a sync round-trip: merge the peer's view and keep
    /// pushing while it is behind and advancing.
    pub(crate) fn on_sync_outcome(
        &mut self,
        peer: MemberId,
        commit_hint: Index,
        result: Result<SyncResponse>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("member {}: sync to {peer} failed: {e}", self.id);
                return Ok(());
            }
        };
        self.members.merge(&response.members);

        if let Some(member) = self.members.get(peer).cloned() {
            let behind = member.commit_index < self.log.commit_index();
            let advancing = member.commit_index > commit_hint;
            if behind && advancing {
                self.send_sync(member);
            }
        }
        Ok(())
    }
}
