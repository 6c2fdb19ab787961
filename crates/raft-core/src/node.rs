//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management; commit.rs and client.rs extend it
//! what: NodeState enum, LeaderState, RaftNode with election, voting and replication handlers

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::commit::{PendingQuery, Waiter};
use crate::config::RaftConfig;
use crate::error::{ErrorKind, NodeError};
use crate::log::{Log, LogEntry, Operation};
use crate::message::{
    AppendRequest, AppendResponse, Appended, NodeId, Outbound, Response, Vote, VoteRequest,
    VoteResponse,
};
use crate::publisher::EventPublisher;
use crate::sequencer::CommandSequencer;
use crate::session::SessionTable;
use crate::state_machine::{StateMachine, StateMachineExecutor};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Bookkeeping that only exists while this node leads.
///
/// Dropped as a whole on step-down, after everything waiting on it has been
/// failed.
#[derive(Debug)]
pub struct LeaderState {
    /// Next log index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Highest log index known to be replicated on each peer
    pub match_index: HashMap<NodeId, u64>,
    /// Index of the no-op appended on election
    pub noop_index: u64,
    /// Number of append broadcasts sent this term
    pub round: u64,
    /// Highest round each peer has answered in this term
    pub(crate) acked_round: HashMap<NodeId, u64>,
    pub(crate) sequencer: CommandSequencer,
    pub(crate) publisher: EventPublisher,
}

/// A single Raft node in the cluster.
///
/// The node is sans-I/O: handlers mutate state and return responses, while
/// messages for other nodes and clients accumulate in an outbox that the
/// owner drains with [`RaftNode::take_outbound`].
#[derive(Debug)]
pub struct RaftNode<L, S> {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every voting member, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Leader of the current term, once known
    pub leader: Option<NodeId>,
    /// Votes collected while a candidate
    pub votes_received: Vec<NodeId>,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index applied to the state machine
    pub last_applied: u64,
    pub log: L,
    pub(crate) executor: StateMachineExecutor<S>,
    pub(crate) leader_state: Option<LeaderState>,
    pub(crate) waiters: BTreeMap<u64, Vec<Waiter>>,
    pub(crate) queries: Vec<PendingQuery>,
    pub(crate) outbox: Vec<Outbound>,
    pub(crate) now: u64,
}

impl<L: Log, S: StateMachine> RaftNode<L, S> {
    /// Create a node in Follower state, restoring term and vote from the log.
    pub fn new(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        log: L,
        state_machine: S,
    ) -> Result<Self, NodeError> {
        Self::with_config(id, cluster_nodes, log, state_machine, RaftConfig::default())
    }

    pub fn with_config(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        log: L,
        state_machine: S,
        config: RaftConfig,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let (current_term, voted_for) = log.load_vote()?;
        Ok(Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term,
            voted_for,
            leader: None,
            votes_received: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            log,
            executor: StateMachineExecutor::new(state_machine),
            leader_state: None,
            waiters: BTreeMap::new(),
            queries: Vec::new(),
            outbox: Vec::new(),
            now: 0,
        })
    }

    /// Set the wall clock (milliseconds) stamped onto entries this node appends.
    pub fn set_time(&mut self, now: u64) {
        self.now = now;
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        self.leader_state.as_ref()
    }

    pub fn sessions(&self) -> &SessionTable {
        self.executor.sessions()
    }

    pub fn state_machine(&self) -> &S {
        self.executor.state_machine()
    }

    /// Drain messages produced since the last call.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes
            .iter()
            .copied()
            .filter(move |node| *node != self.id)
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<LogEntry> {
        self.log.get(index)
    }

    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index)
    }

    fn persist_vote(&mut self) -> bool {
        match self.log.save_vote(self.current_term, self.voted_for) {
            Ok(()) => true,
            Err(error) => {
                warn!(node_id = self.id, term = self.current_term, %error, "failed to persist vote");
                false
            }
        }
    }

    /// Convert to follower, adopting `term` if it is newer.
    ///
    /// Leaving leadership fails every pending client request with `NoLeader`.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader = None;
            self.persist_vote();
        }
        if self.state != NodeState::Follower {
            info!(node_id = self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        if let Some(mut leader_state) = self.leader_state.take() {
            for command in leader_state.sequencer.drain() {
                command.fail(ErrorKind::NoLeader);
            }
            self.fail_pending(ErrorKind::NoLeader, false);
        }
    }

    /// Start an election: become candidate, bump the term and vote for ourselves.
    ///
    /// Vote requests for every peer are queued in the outbox. Returns `None`
    /// and stays a follower if the self-vote cannot be made durable.
    pub fn start_election(&mut self) -> Option<VoteRequest> {
        if self.leader_state.is_some() {
            self.become_follower(self.current_term);
        }
        let (term, voted_for) = (self.current_term, self.voted_for);
        self.current_term += 1;
        self.voted_for = Some(self.id);
        if !self.persist_vote() {
            self.current_term = term;
            self.voted_for = voted_for;
            self.state = NodeState::Follower;
            self.votes_received.clear();
            return None;
        }
        self.state = NodeState::Candidate;
        self.leader = None;
        self.votes_received = vec![self.id];
        info!(node_id = self.id, term = self.current_term, "starting election");

        let request = VoteRequest {
            term: self.current_term,
            candidate: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        let peers: Vec<NodeId> = self.peers().collect();
        for peer in peers {
            self.outbox.push(Outbound::Vote {
                to: peer,
                request: request.clone(),
            });
        }

        if self.has_quorum() {
            self.become_leader();
        }
        Some(request)
    }

    /// Handle a vote request. Returns the response and whether the election
    /// timer should be reset (a vote was granted).
    pub fn handle_vote_request(&mut self, request: VoteRequest) -> (VoteResponse, bool) {
        if request.term > self.current_term {
            debug!(node_id = self.id, term = request.term, "observed higher term in vote request");
            self.become_follower(request.term);
        }

        let deny = |term| (Response::Ok(Vote { term, voted: false }), false);
        if request.term < self.current_term {
            debug!(node_id = self.id, candidate = request.candidate, "rejecting vote for stale term");
            return deny(self.current_term);
        }
        if matches!(self.voted_for, Some(voted) if voted != request.candidate) {
            debug!(node_id = self.id, candidate = request.candidate, voted_for = ?self.voted_for, "already voted this term");
            return deny(self.current_term);
        }
        let up_to_date = request.last_log_term > self.last_log_term()
            || (request.last_log_term == self.last_log_term()
                && request.last_log_index >= self.last_log_index());
        if !up_to_date {
            debug!(node_id = self.id, candidate = request.candidate, "rejecting candidate with stale log");
            return deny(self.current_term);
        }

        let previous = self.voted_for.replace(request.candidate);
        if !self.persist_vote() {
            self.voted_for = previous;
            return (Response::Error(ErrorKind::InternalError), false);
        }
        debug!(node_id = self.id, candidate = request.candidate, term = self.current_term, "granted vote");
        (
            Response::Ok(Vote {
                term: self.current_term,
                voted: true,
            }),
            true,
        )
    }

    /// Handle a vote response. Returns true if this node just became leader.
    pub fn handle_vote_response(&mut self, from: NodeId, response: VoteResponse) -> bool {
        let Response::Ok(vote) = response else {
            return false;
        };
        if vote.term > self.current_term {
            self.become_follower(vote.term);
            return false;
        }
        if self.state != NodeState::Candidate || vote.term < self.current_term || !vote.voted {
            return false;
        }
        if !self.cluster_nodes.contains(&from) {
            warn!(node_id = self.id, from, "vote from non-member ignored");
            return false;
        }
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    fn become_leader(&mut self) {
        info!(node_id = self.id, term = self.current_term, votes = self.votes_received.len(), "won election");
        self.state = NodeState::Leader;
        self.leader = Some(self.id);
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        let mut sequencer = CommandSequencer::new();
        for index in (self.last_applied + 1)..=self.log.last_index() {
            if let Some(LogEntry {
                operation: Operation::Command { session, sequence, .. },
                ..
            }) = self.log.get(index)
            {
                sequencer.seed(session, sequence, index);
            }
        }
        self.leader_state = Some(LeaderState {
            next_index: peers.iter().map(|peer| (*peer, next)).collect(),
            match_index: peers.iter().map(|peer| (*peer, 0)).collect(),
            noop_index: 0,
            round: 0,
            acked_round: HashMap::new(),
            sequencer,
            publisher: EventPublisher::new(),
        });

        match self.log.append(self.current_term, Operation::NoOp) {
            Ok(index) => {
                if let Some(leader_state) = self.leader_state.as_mut() {
                    leader_state.noop_index = index;
                }
            }
            Err(error) => {
                warn!(node_id = self.id, %error, "failed to append no-op, stepping down");
                self.become_follower(self.current_term);
                return;
            }
        }
        self.replicate();
        self.publish_events();
    }

    /// Build the append request for `peer` from its next index.
    ///
    /// Carries no entries when the peer is caught up, which makes it a heartbeat.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendRequest> {
        let leader_state = self.leader_state.as_ref()?;
        let next = leader_state
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_log_index = next - 1;
        Some(AppendRequest {
            term: self.current_term,
            leader: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: self
                .log
                .entries_from(next, self.config.max_entries_per_append),
            commit_index: self.commit_index,
            round: leader_state.round,
        })
    }

    /// Send an append request to every peer.
    pub fn heartbeat(&mut self) {
        trace!(node_id = self.id, term = self.current_term, "heartbeat");
        self.replicate();
    }

    /// Queue append requests for every peer, then try to commit. In a
    /// single-node cluster the commit happens here.
    pub(crate) fn replicate(&mut self) {
        let Some(leader_state) = self.leader_state.as_mut() else {
            return;
        };
        leader_state.round += 1;
        let peers: Vec<NodeId> = self.peers().collect();
        for peer in peers {
            if let Some(request) = self.create_append_entries(peer) {
                self.outbox.push(Outbound::Append { to: peer, request });
            }
        }
        self.advance_commit_index();
    }

    /// Handle an append request. Returns the response and whether the
    /// election timer should be reset (the request came from a valid leader).
    pub fn handle_append_entries(&mut self, request: AppendRequest) -> (AppendResponse, bool) {
        let round = request.round;
        if request.term < self.current_term {
            debug!(node_id = self.id, leader = request.leader, term = request.term, "rejecting append from stale leader");
            return (self.append_failure(self.log.last_index(), round), false);
        }
        if request.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(request.term);
        }
        if self.leader != Some(request.leader) {
            info!(node_id = self.id, leader = request.leader, term = self.current_term, "following new leader");
            self.leader = Some(request.leader);
        }

        let last_index = self.log.last_index();
        if request.prev_log_index > last_index {
            return (self.append_failure(last_index, round), true);
        }
        if self.log.term_at(request.prev_log_index) != request.prev_log_term {
            return (self.append_failure(request.prev_log_index.saturating_sub(1), round), true);
        }

        let mut expected = request.prev_log_index + 1;
        for entry in request.entries {
            if entry.index != expected {
                warn!(node_id = self.id, index = entry.index, expected, "append entries are not contiguous");
                return (Response::Error(ErrorKind::ProtocolError), true);
            }
            expected += 1;

            if entry.index <= self.log.last_index() {
                if self.log.term_at(entry.index) == entry.term {
                    continue;
                }
                if entry.index <= self.commit_index {
                    warn!(node_id = self.id, index = entry.index, "leader conflicts with a committed entry");
                    return (Response::Error(ErrorKind::ProtocolError), true);
                }
                debug!(node_id = self.id, index = entry.index, "truncating conflicting entries");
                if let Err(error) = self.log.truncate_after(entry.index - 1) {
                    warn!(node_id = self.id, %error, "failed to truncate log");
                    return (Response::Error(ErrorKind::InternalError), true);
                }
            }
            match self.log.append(entry.term, entry.operation) {
                Ok(index) if index == entry.index => {}
                Ok(index) => {
                    warn!(node_id = self.id, index, expected = entry.index, "log appended at unexpected index");
                    return (Response::Error(ErrorKind::InternalError), true);
                }
                Err(error) => {
                    warn!(node_id = self.id, %error, "failed to append replicated entry");
                    return (Response::Error(ErrorKind::InternalError), true);
                }
            }
        }

        let matched = expected - 1;
        if request.commit_index > self.commit_index {
            let commit = request.commit_index.min(matched);
            if commit > self.commit_index {
                debug!(node_id = self.id, commit, "follower advancing commit index");
                self.commit_index = commit;
                self.apply_committed();
            }
        }

        (
            Response::Ok(Appended {
                term: self.current_term,
                succeeded: true,
                last_log_index: matched,
                round,
            }),
            true,
        )
    }

    fn append_failure(&self, hint: u64, round: u64) -> AppendResponse {
        Response::Ok(Appended {
            term: self.current_term,
            succeeded: false,
            last_log_index: hint,
            round,
        })
    }

    /// Handle an append response. Returns true if the commit index advanced.
    pub fn handle_append_entries_response(&mut self, from: NodeId, response: AppendResponse) -> bool {
        let Response::Ok(appended) = response else {
            return false;
        };
        if appended.term > self.current_term {
            self.become_follower(appended.term);
            return false;
        }
        if self.state != NodeState::Leader || appended.term < self.current_term {
            return false;
        }

        let last_index = self.log.last_index();
        let Some(leader_state) = self.leader_state.as_mut() else {
            return false;
        };
        let Some(next) = leader_state.next_index.get(&from).copied() else {
            warn!(node_id = self.id, from, "append response from non-member ignored");
            return false;
        };
        let acked = leader_state.acked_round.entry(from).or_insert(0);
        *acked = (*acked).max(appended.round);

        let advanced = if appended.succeeded {
            let matched = leader_state.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(appended.last_log_index.min(last_index));
            let matched = *matched;
            leader_state.next_index.insert(from, matched + 1);

            let advanced = self.advance_commit_index();
            if matched < self.log.last_index() {
                if let Some(request) = self.create_append_entries(from) {
                    self.outbox.push(Outbound::Append { to: from, request });
                }
            }
            advanced
        } else {
            let retry = next
                .saturating_sub(1)
                .min(appended.last_log_index + 1)
                .max(1);
            leader_state.next_index.insert(from, retry);
            debug!(node_id = self.id, peer = from, next_index = retry, "peer rejected append, backing off");
            if let Some(request) = self.create_append_entries(from) {
                self.outbox.push(Outbound::Append { to: from, request });
            }
            false
        };
        self.serve_queries();
        advanced
    }

    /// Highest round answered by a quorum, counting this node at its own round.
    ///
    /// A read registered at round `r` is safe once this reaches `r`: a quorum
    /// still accepted this node as leader after the read arrived.
    pub(crate) fn confirmed_round(&self) -> u64 {
        let Some(leader_state) = self.leader_state.as_ref() else {
            return 0;
        };
        let mut rounds: Vec<u64> = self
            .peers()
            .map(|peer| leader_state.acked_round.get(&peer).copied().unwrap_or(0))
            .collect();
        rounds.push(leader_state.round);
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        rounds
            .get(self.quorum_size().saturating_sub(1))
            .copied()
            .unwrap_or(0)
    }

    /// Fail everything still pending; called when the owning task stops.
    pub fn shutdown(&mut self) {
        if let Some(mut leader_state) = self.leader_state.take() {
            for command in leader_state.sequencer.drain() {
                command.fail(ErrorKind::NoLeader);
            }
        }
        self.fail_pending(ErrorKind::NoLeader, true);
    }
}
