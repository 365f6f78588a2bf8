//! Per-role handlers for the six wire RPCs, plus election initiation.
//!
//! Handlers run synchronously on the context task; anything that must wait
//! (submit commits, linearizable reads) parks a oneshot and is answered by
//! the commit engine later.

use crate::context::{Message, RaftContext};
use crate::role::{CandidateState, PreVote, Role};
use crate::state_machine::StateMachine;
use common::{Error, Member, MemberId, Result, Term};
use log::{debug, info, warn};
use protocol::{
    AppendRequest, AppendResponse, Consistency, ErrorKind, Operation, PollRequest, PollResponse,
    Request, Response, Status, StatusResponse, SubmitResponse, SyncRequest, VoteRequest,
    VoteResponse,
};
use std::collections::HashSet;
use storage::EntryKind;
use tokio::sync::oneshot;

impl<SM: StateMachine> RaftContext<SM> {
    pub(crate) fn handle_rpc(
        &mut self,
        request: Request,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        match request {
            Request::Submit(req) => self.handle_submit_rpc(req.operation, reply),
            Request::Append(req) => {
                let response = self.handle_append(req)?;
                let _ = reply.send(Response::Append(response));
                Ok(())
            }
            Request::Vote(req) => {
                let response = self.handle_vote(req)?;
                let _ = reply.send(Response::Vote(response));
                Ok(())
            }
            Request::Poll(req) => {
                let response = self.handle_poll(req)?;
                let _ = reply.send(Response::Poll(response));
                Ok(())
            }
            Request::Sync(req) => {
                let response = self.handle_sync(req)?;
                let _ = reply.send(Response::Sync(response));
                Ok(())
            }
            Request::Status(_) => {
                let _ = reply.send(Response::Status(self.handle_status()));
                Ok(())
            }
        }
    }

    /// Log replication from the leader.
    pub(crate) fn handle_append(&mut self, req: AppendRequest) -> Result<AppendResponse> {
        if matches!(self.role, Role::Passive | Role::Start) {
            return Ok(AppendResponse {
                status: Status::Error,
                error: Some(ErrorKind::IllegalMemberState),
                term: self.term,
                succeeded: false,
                log_index: self.log.last_index(),
            });
        }
        if req.term < self.term {
            return Ok(self.append_failure());
        }

        // Adopt the leader's term and authority; a candidate or stale
        // leader falls back to follower before processing.
        if req.term > self.term || !matches!(self.role, Role::Follower(_)) {
            self.step_down(req.term)?;
        }
        self.leader = Some(req.leader);
        self.reset_election_timer();
        if let Role::Follower(fs) = &mut self.role {
            fs.pre_vote = None;
        }

        // Log-matching check on the entry preceding the batch.
        if req.prev_log_index > 0 {
            let matches = self.log.last_index() >= req.prev_log_index
                && self.log.term_of(req.prev_log_index)? == Some(req.prev_log_term);
            if !matches {
                debug!(
                    "member {}: append rejected, no match at index {} term {}",
                    self.id, req.prev_log_index, req.prev_log_term
                );
                return Ok(self.append_failure());
            }
        }

        // Append, truncating a divergent suffix at the first conflict.
        let mut appended = false;
        for entry in &req.entries {
            if entry.index < self.log.next_index() {
                match self.log.term_of(entry.index)? {
                    Some(term) if term == entry.term => continue,
                    _ => {
                        debug!(
                            "member {}: truncating divergent suffix from index {}",
                            self.id, entry.index
                        );
                        self.log.truncate(entry.index - 1)?;
                    }
                }
            }
            let next = self.log.next_index();
            if entry.index > next {
                self.log.skip(entry.index - next)?;
            }
            self.log.append_entry(entry.clone())?;
            appended = true;
        }
        if appended {
            self.log.sync()?;
        }

        self.commit_to(req.commit_index.min(self.log.last_index()))?;

        Ok(AppendResponse {
            status: Status::Ok,
            error: None,
            term: self.term,
            succeeded: true,
            log_index: self.log.last_index(),
        })
    }

    fn append_failure(&self) -> AppendResponse {
        AppendResponse {
            status: Status::Ok,
            error: None,
            term: self.term,
            succeeded: false,
            log_index: self.log.last_index(),
        }
    }

    /// Election ballot. The vote is persisted before the response leaves.
    pub(crate) fn handle_vote(&mut self, req: VoteRequest) -> Result<VoteResponse> {
        if matches!(self.role, Role::Passive | Role::Start) {
            return Ok(VoteResponse {
                status: Status::Error,
                error: Some(ErrorKind::IllegalMemberState),
                term: self.term,
                vote_granted: false,
            });
        }
        if req.term < self.term {
            return Ok(VoteResponse {
                status: Status::Ok,
                error: None,
                term: self.term,
                vote_granted: false,
            });
        }
        if req.term > self.term {
            self.step_down(req.term)?;
        }

        let granted = self.log_up_to_date(req.last_log_index, req.last_log_term)?
            && (self.voted_for.is_none() || self.voted_for == Some(req.candidate));
        if granted {
            self.voted_for = Some(req.candidate);
            self.persist_meta()?;
            self.reset_election_timer();
            debug!(
                "member {}: voted for {} in term {}",
                self.id, req.candidate, self.term
            );
        }
        Ok(VoteResponse {
            status: Status::Ok,
            error: None,
            term: self.term,
            vote_granted: granted,
        })
    }

    /// Pre-vote probe: evaluates the vote predicate without granting,
    /// persisting, or resetting timers.
    pub(crate) fn handle_poll(&mut self, req: PollRequest) -> Result<PollResponse> {
        if matches!(self.role, Role::Passive | Role::Start) {
            return Ok(PollResponse {
                status: Status::Error,
                error: Some(ErrorKind::IllegalMemberState),
                term: self.term,
                vote_granted: false,
            });
        }
        let would_grant = req.term >= self.term
            && self.log_up_to_date(req.last_log_index, req.last_log_term)?
            && (req.term > self.term
                || self.voted_for.is_none()
                || self.voted_for == Some(req.candidate));
        Ok(PollResponse {
            status: Status::Ok,
            error: None,
            term: self.term,
            vote_granted: would_grant,
        })
    }

    /// The candidate-completeness predicate (section 5.4.1 in the Raft
    /// paper): the candidate's log must be at least as up to date as ours.
    fn log_up_to_date(&self, last_log_index: u64, last_log_term: Term) -> Result<bool> {
        let our_term = self.last_log_term()?;
        Ok(last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.log.last_index()))
    }

    /// Leader discovery; answered by every role.
    pub(crate) fn handle_status(&self) -> StatusResponse {
        StatusResponse {
            status: Status::Ok,
            error: None,
            term: self.term,
            leader: self.leader,
        }
    }

    /// A submit arriving over the wire: the reply is deferred until the
    /// commit pipeline answers.
    fn handle_submit_rpc(
        &mut self,
        operation: Operation,
        reply: oneshot::Sender<Response>,
    ) -> Result<()> {
        let leader_hint = self.leader;
        let (tx, rx) = oneshot::channel();
        self.handle_submit(operation, tx)?;
        tokio::spawn(async move {
            let response = match rx.await {
                Ok(Ok(result)) => SubmitResponse::ok(result, leader_hint),
                Ok(Err(e)) => {
                    let hint = match &e {
                        Error::NoLeader { leader } => leader.or(leader_hint),
                        _ => leader_hint,
                    };
                    SubmitResponse::error(ErrorKind::from_error(&e), hint)
                }
                Err(_) => SubmitResponse::error(ErrorKind::NoLeader, leader_hint),
            };
            let _ = reply.send(Response::Submit(response));
        });
        Ok(())
    }

    /// Local or wire submit entry point.
    pub(crate) fn handle_submit(
        &mut self,
        operation: Operation,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        match operation {
            Operation::Query {
                payload,
                consistency,
            } => self.handle_query(payload, consistency, reply),
            Operation::Command { key, payload } => {
                if !self.role.is_leader() {
                    let _ = reply.send(Err(Error::NoLeader {
                        leader: self.leader,
                    }));
                    return Ok(());
                }
                self.replicate_command(EntryKind::Command, key, payload, reply)
            }
        }
    }

    /// Replicate a membership change as a configuration entry.
    pub(crate) fn handle_reconfigure(
        &mut self,
        members: Vec<Member>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        if !self.role.is_leader() {
            let _ = reply.send(Err(Error::NoLeader {
                leader: self.leader,
            }));
            return Ok(());
        }
        let payload =
            bincode::serde::encode_to_vec(&members, bincode::config::standard()).map_err(|e| {
                Error::Protocol(format!("membership encoding failed: {e}"))
            })?;
        self.members.merge(&members);
        self.replicate_command(EntryKind::Configuration, Vec::new(), payload, reply)
    }

    /// Append, replicate, and park the reply on the entry's index.
    fn replicate_command(
        &mut self,
        kind: EntryKind,
        key: Vec<u8>,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        let appended = self
            .log
            .append(self.term, kind, key, payload)
            .and_then(|index| self.log.sync().map(|_| index));
        match appended {
            Ok(index) => {
                self.waiters.insert(index, reply);
                self.advance_commit()?; // a single-node quorum commits here
                self.broadcast_append()?;
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                let text = e.to_string();
                let _ = reply.send(Err(Error::Corruption(text.clone())));
                Err(Error::Corruption(text))
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                Ok(())
            }
        }
    }

    /// Serve a query at the requested consistency level.
    fn handle_query(
        &mut self,
        payload: Vec<u8>,
        consistency: Consistency,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        match consistency {
            // Served from local apply state on any node.
            Consistency::Serializable => {
                let _ = reply.send(self.state_machine.query(&payload));
                Ok(())
            }
            Consistency::LinearizableLease => {
                if let Role::Leader(state) = &self.role {
                    if state.last_quorum_contact.elapsed() < self.config.election_timeout {
                        let _ = reply.send(self.state_machine.query(&payload));
                        return Ok(());
                    }
                    // Lease expired; fall back to a quorum round.
                    return self.queue_linearizable_read(payload, reply);
                }
                let _ = reply.send(Err(Error::NoLeader {
                    leader: self.leader,
                }));
                Ok(())
            }
            Consistency::LinearizableStrict => {
                if !self.role.is_leader() {
                    let _ = reply.send(Err(Error::NoLeader {
                        leader: self.leader,
                    }));
                    return Ok(());
                }
                self.queue_linearizable_read(payload, reply)
            }
        }
    }

    /// Election timer fired: a follower pre-votes, a candidate re-runs its
    /// election with a fresh term.
    pub(crate) fn on_election_timeout(&mut self) -> Result<()> {
        match self.role {
            Role::Follower(_) => self.start_pre_vote(),
            Role::Candidate(_) => {
                info!(
                    "member {}: election for term {} timed out, retrying",
                    self.id, self.term
                );
                self.start_election()
            }
            _ => Ok(()),
        }
    }

    /// Probe voting peers with Poll before risking a disruptive election.
    fn start_pre_vote(&mut self) -> Result<()> {
        self.reset_election_timer();
        if self.members.quorum() <= 1 {
            return self.start_election();
        }

        let term = self.term + 1;
        let last_log_index = self.log.last_index();
        let last_log_term = self.last_log_term()?;

        if let Role::Follower(fs) = &mut self.role {
            let mut grants = HashSet::new();
            grants.insert(self.id);
            fs.pre_vote = Some(PreVote { term, grants });
        }
        debug!("member {}: pre-voting for term {term}", self.id);

        let peers: Vec<Member> = self
            .members
            .voting()
            .filter(|m| m.id != self.id)
            .cloned()
            .collect();
        for peer in peers {
            let peer_id = peer.id;
            let request = Request::Poll(PollRequest {
                term,
                candidate: self.id,
                last_log_index,
                last_log_term,
            });
            self.spawn_send(peer, request, move |result| Message::PollOutcome {
                peer: peer_id,
                term,
                result: result.and_then(expect_poll),
            });
        }
        Ok(())
    }

    pub(crate) fn on_poll_outcome(
        &mut self,
        peer: MemberId,
        term: Term,
        result: Result<PollResponse>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("member {}: poll to {peer} failed: {e}", self.id);
                return Ok(());
            }
        };
        if response.term > self.term {
            return self.adopt_term(response.term);
        }

        let quorum = self.members.quorum();
        let mut promote = false;
        if let Role::Follower(fs) = &mut self.role {
            if let Some(pre) = &mut fs.pre_vote {
                if pre.term == term && response.vote_granted {
                    pre.grants.insert(peer);
                    promote = pre.grants.len() >= quorum;
                }
            }
        }
        if promote {
            self.start_election()?;
        }
        Ok(())
    }

    /// Become candidate: bump the term, vote for ourselves, solicit votes.
    fn start_election(&mut self) -> Result<()> {
        self.term += 1;
        self.voted_for = Some(self.id);
        self.leader = None;
        self.persist_meta()?;

        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate(CandidateState { votes });
        self.reset_election_timer();
        info!(
            "member {}: starting election for term {}",
            self.id, self.term
        );

        if self.members.quorum() <= 1 {
            return self.become_leader();
        }

        let term = self.term;
        let last_log_index = self.log.last_index();
        let last_log_term = self.last_log_term()?;
        let peers: Vec<Member> = self
            .members
            .voting()
            .filter(|m| m.id != self.id)
            .cloned()
            .collect();
        for peer in peers {
            let peer_id = peer.id;
            let request = Request::Vote(VoteRequest {
                term,
                candidate: self.id,
                last_log_index,
                last_log_term,
            });
            self.spawn_send(peer, request, move |result| Message::VoteOutcome {
                peer: peer_id,
                term,
                result: result.and_then(expect_vote),
            });
        }
        Ok(())
    }

    pub(crate) fn on_vote_outcome(
        &mut self,
        peer: MemberId,
        term: Term,
        result: Result<VoteResponse>,
    ) -> Result<()> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                debug!("member {}: vote request to {peer} failed: {e}", self.id);
                return Ok(());
            }
        };
        if response.term > self.term {
            return self.step_down(response.term);
        }
        if term != self.term {
            return Ok(()); // a stale round
        }

        let quorum = self.members.quorum();
        let mut won = false;
        if let Role::Candidate(cs) = &mut self.role {
            if response.vote_granted {
                cs.votes.insert(peer);
                won = cs.votes.len() >= quorum;
            }
        }
        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    /// Gossip receipt: adopt newer terms, absorb committed entries (passive
    /// members only; active members receive entries through Append), and
    /// merge the membership view.
    pub(crate) fn handle_sync(&mut self, req: SyncRequest) -> Result<protocol::SyncResponse> {
        if req.term > self.term {
            self.step_down(req.term)?;
        }
        if req.term >= self.term {
            if let Some(leader) = req.leader {
                self.leader = Some(leader);
            }
        }

        if matches!(self.role, Role::Passive) {
            let mut caught_up_to = 0;
            for entry in &req.entries {
                let next = self.log.next_index();
                if entry.index < next {
                    continue;
                }
                if entry.index > next {
                    self.log.skip(entry.index - next)?;
                }
                self.log.append_entry(entry.clone())?;
                caught_up_to = entry.index;
            }
            if caught_up_to > 0 {
                self.log.sync()?;
                self.commit_to(caught_up_to)?;
                debug!(
                    "member {}: gossip caught up through index {caught_up_to}",
                    self.id
                );
            }
        }

        self.members.merge(&req.members);

        Ok(protocol::SyncResponse {
            status: Status::Ok,
            error: None,
            members: self.members.all(),
        })
    }
}

pub(crate) fn expect_append(response: Response) -> Result<AppendResponse> {
    match response {
        Response::Append(r) => Ok(r),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn expect_vote(response: Response) -> Result<VoteResponse> {
    match response {
        Response::Vote(r) => Ok(r),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn expect_poll(response: Response) -> Result<PollResponse> {
    match response {
        Response::Poll(r) => Ok(r),
        other => Err(unexpected(&other)),
    }
}

pub(crate) fn expect_sync(response: Response) -> Result<protocol::SyncResponse> {
    match response {
        Response::Sync(r) => Ok(r),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> Error {
    warn!("unexpected response variant: {response:?}");
    Error::Protocol("unexpected response variant".into())
}
