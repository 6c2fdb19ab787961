//! # commit
//!
//! why: move the commit index forward and apply entries strictly in order
//! relations: extends RaftNode from node.rs; completes the waiters registered by client.rs
//! what: advance_commit_index, apply_committed, query serving, event publishing

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::log::{Log, LogEntry, Operation};
use crate::message::{
    CommandResponse, Consistency, KeepAliveResponse, KeptAlive, QueryRequest, QueryResponse,
    RegisterResponse, Registered, Response, SessionId, UnregisterResponse,
};
use crate::node::RaftNode;
use crate::state_machine::{Applied, StateMachine};

/// A client reply waiting on a log index.
#[derive(Debug)]
pub(crate) enum Waiter {
    Command(oneshot::Sender<CommandResponse>),
    Register(oneshot::Sender<RegisterResponse>),
    KeepAlive(oneshot::Sender<KeepAliveResponse>),
    Unregister(oneshot::Sender<UnregisterResponse>),
}

impl Waiter {
    pub(crate) fn fail(self, kind: ErrorKind) {
        match self {
            Waiter::Command(reply) => {
                let _ = reply.send(Response::Error(kind));
            }
            Waiter::Register(reply) => {
                let _ = reply.send(Response::Error(kind));
            }
            Waiter::KeepAlive(reply) => {
                let _ = reply.send(Response::Error(kind));
            }
            Waiter::Unregister(reply) => {
                let _ = reply.send(Response::Error(kind));
            }
        }
    }
}

/// A query waiting for the state machine to reach `read_index`.
///
/// Linearizable queries also wait until a quorum has answered broadcast
/// `round`; sequential queries use round 0.
#[derive(Debug)]
pub(crate) struct PendingQuery {
    pub(crate) read_index: u64,
    pub(crate) round: u64,
    pub(crate) request: QueryRequest,
    pub(crate) reply: oneshot::Sender<QueryResponse>,
}

impl<L: Log, S: StateMachine> RaftNode<L, S> {
    /// Advance the commit index to the highest index stored on a quorum.
    ///
    /// Only entries from the current term are committed by counting replicas;
    /// earlier entries commit along with them. Returns true if anything committed.
    pub fn advance_commit_index(&mut self) -> bool {
        let Some(leader_state) = self.leader_state.as_ref() else {
            return false;
        };
        let quorum = self.quorum_size();
        let mut commit = self.commit_index;
        for index in (self.commit_index + 1)..=self.log.last_index() {
            let replicas = 1 + leader_state
                .match_index
                .values()
                .filter(|matched| **matched >= index)
                .count();
            if replicas < quorum {
                break;
            }
            if self.log.term_at(index) == self.current_term {
                commit = index;
            }
        }
        if commit == self.commit_index {
            return false;
        }
        debug!(node_id = self.id, from = self.commit_index, to = commit, "advancing commit index");
        self.commit_index = commit;
        self.apply_committed();
        true
    }

    /// Apply every committed entry not yet applied, then serve queries and
    /// publish events that became visible.
    pub(crate) fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index) else {
                warn!(node_id = self.id, index, "committed entry missing from log");
                break;
            };
            self.last_applied = index;
            self.apply_entry(entry);
        }
        self.serve_queries();
        self.publish_events();
    }

    fn apply_entry(&mut self, entry: LogEntry) {
        if let Some(timestamp) = entry.operation.timestamp() {
            for session in self.executor.expire(timestamp) {
                self.session_closed(session);
            }
        }

        let applied = self.executor.apply(&entry);
        match (&applied, &entry.operation) {
            (Applied::Command { session, sequence, .. }, _) => {
                if let Some(leader_state) = self.leader_state.as_mut() {
                    leader_state.sequencer.applied(*session, *sequence);
                }
            }
            (Applied::Unregistered(Ok(())), Operation::Unregister { session, .. }) => {
                self.session_closed(*session);
            }
            _ => {}
        }

        if let Some(waiters) = self.waiters.remove(&entry.index) {
            for waiter in waiters {
                self.complete(waiter, &applied);
            }
        }
    }

    fn complete(&self, waiter: Waiter, applied: &Applied) {
        let leader = self.leader.unwrap_or(self.id);
        match (waiter, applied) {
            (Waiter::Command(reply), Applied::Command { result, .. }) => {
                let _ = reply.send(result.clone().into());
            }
            (Waiter::Register(reply), Applied::Registered { session, timeout }) => {
                let _ = reply.send(Response::Ok(Registered {
                    session: *session,
                    leader,
                    members: self.cluster_nodes.clone(),
                    timeout: *timeout,
                }));
            }
            (Waiter::KeepAlive(reply), Applied::KeptAlive(result)) => {
                let _ = reply.send(
                    (*result)
                        .map(|()| KeptAlive {
                            leader,
                            members: self.cluster_nodes.clone(),
                        })
                        .into(),
                );
            }
            (Waiter::Unregister(reply), Applied::Unregistered(result)) => {
                let _ = reply.send((*result).into());
            }
            (waiter, applied) => {
                warn!(node_id = self.id, ?applied, "applied entry does not match its waiter");
                waiter.fail(ErrorKind::ProtocolError);
            }
        }
    }

    /// Release everything tied to a session that expired or unregistered.
    fn session_closed(&mut self, session: SessionId) {
        if let Some(leader_state) = self.leader_state.as_mut() {
            for command in leader_state.sequencer.forget(session) {
                command.fail(ErrorKind::UnknownSession);
            }
            leader_state.publisher.forget(session);
        }
        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queries)
            .into_iter()
            .partition(|query| query.request.session == session);
        self.queries = open;
        for query in closed {
            let _ = query.reply.send(Response::Error(ErrorKind::UnknownSession));
        }
    }

    pub(crate) fn serve_queries(&mut self) {
        if self.queries.is_empty() {
            return;
        }
        let applied = self.last_applied;
        let confirmed = self.confirmed_round();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queries)
            .into_iter()
            .partition(|query| query.read_index <= applied && query.round <= confirmed);
        self.queries = waiting;
        for query in ready {
            let response = self
                .executor
                .query(query.request.session, applied, &query.request.query)
                .into();
            let _ = query.reply.send(response);
        }
    }

    /// Queue deliveries for events not yet sent. Leader only.
    pub(crate) fn publish_events(&mut self) {
        let Some(leader_state) = self.leader_state.as_mut() else {
            return;
        };
        let outbound = leader_state.publisher.publish(self.executor.sessions());
        self.outbox.extend(outbound);
    }

    /// Fail every client waiting on a log index, and the pending queries.
    ///
    /// Sequential queries survive unless `all_queries` is set; any node can
    /// still serve them.
    pub(crate) fn fail_pending(&mut self, kind: ErrorKind, all_queries: bool) {
        for (_, waiters) in std::mem::take(&mut self.waiters) {
            for waiter in waiters {
                waiter.fail(kind);
            }
        }
        for query in std::mem::take(&mut self.queries) {
            if all_queries || query.request.consistency == Consistency::Linearizable {
                let _ = query.reply.send(Response::Error(kind));
            } else {
                self.queries.push(query);
            }
        }
    }
}
