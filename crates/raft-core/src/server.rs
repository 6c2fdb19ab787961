//! # server
//!
//! why: give the sans-I/O node a single owner that drives its timers and serializes every input
//! relations: wraps RaftNode from node.rs; transports talk to it through RaftHandle
//! what: RaftServer actor loop, RaftHandle, NodeStatus, ServerError

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, Instrument};

use crate::log::Log;
use crate::message::{
    AppendRequest, AppendResponse, CommandRequest, CommandResponse, KeepAliveRequest,
    KeepAliveResponse, NodeId, Outbound, PublishRequest, PublishResponse, QueryRequest,
    QueryResponse, RegisterRequest, RegisterResponse, UnregisterRequest, UnregisterResponse,
    VoteRequest, VoteResponse,
};
use crate::node::{NodeState, RaftNode};
use crate::state_machine::StateMachine;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("raft server has stopped")]
    Closed,
}

/// Snapshot of a node's role and progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub sessions: usize,
}

#[derive(Debug)]
enum Task {
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    Append {
        request: AppendRequest,
        reply: oneshot::Sender<AppendResponse>,
    },
    VoteResponse {
        from: NodeId,
        response: VoteResponse,
    },
    AppendResponse {
        from: NodeId,
        response: AppendResponse,
    },
    Command {
        request: CommandRequest,
        reply: oneshot::Sender<CommandResponse>,
    },
    Query {
        request: QueryRequest,
        reply: oneshot::Sender<QueryResponse>,
    },
    Register {
        request: RegisterRequest,
        reply: oneshot::Sender<RegisterResponse>,
    },
    KeepAlive {
        request: KeepAliveRequest,
        reply: oneshot::Sender<KeepAliveResponse>,
    },
    Unregister {
        request: UnregisterRequest,
        reply: oneshot::Sender<UnregisterResponse>,
    },
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<PublishResponse>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Cloneable handle to a running [`RaftServer`].
#[derive(Debug, Clone)]
pub struct RaftHandle {
    tasks: mpsc::UnboundedSender<Task>,
}

impl RaftHandle {
    async fn call<T>(&self, task: impl FnOnce(oneshot::Sender<T>) -> Task) -> Result<T, ServerError> {
        let (reply, response) = oneshot::channel();
        self.tasks.send(task(reply)).map_err(|_| ServerError::Closed)?;
        response.await.map_err(|_| ServerError::Closed)
    }

    fn send(&self, task: Task) -> Result<(), ServerError> {
        self.tasks.send(task).map_err(|_| ServerError::Closed)
    }

    pub async fn vote(&self, request: VoteRequest) -> Result<VoteResponse, ServerError> {
        self.call(|reply| Task::Vote { request, reply }).await
    }

    pub async fn append(&self, request: AppendRequest) -> Result<AppendResponse, ServerError> {
        self.call(|reply| Task::Append { request, reply }).await
    }

    /// Deliver a peer's answer to a vote request this node sent.
    pub fn vote_response(&self, from: NodeId, response: VoteResponse) -> Result<(), ServerError> {
        self.send(Task::VoteResponse { from, response })
    }

    /// Deliver a peer's answer to an append request this node sent.
    pub fn append_response(&self, from: NodeId, response: AppendResponse) -> Result<(), ServerError> {
        self.send(Task::AppendResponse { from, response })
    }

    pub async fn command(&self, request: CommandRequest) -> Result<CommandResponse, ServerError> {
        self.call(|reply| Task::Command { request, reply }).await
    }

    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse, ServerError> {
        self.call(|reply| Task::Query { request, reply }).await
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, ServerError> {
        self.call(|reply| Task::Register { request, reply }).await
    }

    pub async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse, ServerError> {
        self.call(|reply| Task::KeepAlive { request, reply }).await
    }

    pub async fn unregister(
        &self,
        request: UnregisterRequest,
    ) -> Result<UnregisterResponse, ServerError> {
        self.call(|reply| Task::Unregister { request, reply }).await
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, ServerError> {
        self.call(|reply| Task::Publish { request, reply }).await
    }

    pub async fn status(&self) -> Result<NodeStatus, ServerError> {
        self.call(|reply| Task::Status { reply }).await
    }

    /// Stop the server. Pending requests are answered with `NoLeader`.
    pub fn shutdown(&self) -> Result<(), ServerError> {
        self.send(Task::Shutdown)
    }
}

/// Owns a [`RaftNode`] on its own task and drives election and heartbeat timers.
pub struct RaftServer<L, S> {
    node: RaftNode<L, S>,
    tasks: mpsc::UnboundedReceiver<Task>,
    outbound: mpsc::UnboundedSender<Outbound>,
    election_deadline: Instant,
}

impl<L, S> RaftServer<L, S>
where
    L: Log + Send + 'static,
    S: StateMachine + Send + 'static,
{
    /// Spawn the server on the current tokio runtime.
    ///
    /// Returns the handle for inbound traffic and the stream of messages the
    /// node wants delivered to peers and clients.
    pub fn spawn(node: RaftNode<L, S>) -> (RaftHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (task_tx, tasks) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let node_id = node.id;
        let election_deadline = Instant::now() + node.config.random_election_timeout();
        let server = Self {
            node,
            tasks,
            outbound,
            election_deadline,
        };
        tokio::spawn(server.run().instrument(info_span!("raft", node_id)));
        (RaftHandle { tasks: task_tx }, outbound_rx)
    }

    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.node.config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(term = self.node.current_term, "raft server started");

        loop {
            let leading = self.node.is_leader();
            tokio::select! {
                task = self.tasks.recv() => match task {
                    Some(Task::Shutdown) | None => break,
                    Some(task) => {
                        self.node.set_time(unix_millis());
                        self.handle(task);
                    }
                },
                () = tokio::time::sleep_until(self.election_deadline), if !leading => {
                    self.node.set_time(unix_millis());
                    self.node.start_election();
                    self.reset_election_timer();
                }
                _ = heartbeat.tick(), if leading => {
                    self.node.set_time(unix_millis());
                    self.node.heartbeat();
                }
            }
            if leading && !self.node.is_leader() {
                // the deadline went stale while leading
                self.reset_election_timer();
            }
            self.flush();
        }

        self.node.shutdown();
        self.flush();
        info!(term = self.node.current_term, "raft server stopped");
    }

    fn handle(&mut self, task: Task) {
        match task {
            Task::Vote { request, reply } => {
                let (response, granted) = self.node.handle_vote_request(request);
                if granted {
                    self.reset_election_timer();
                }
                let _ = reply.send(response);
            }
            Task::Append { request, reply } => {
                let (response, from_leader) = self.node.handle_append_entries(request);
                if from_leader {
                    self.reset_election_timer();
                }
                let _ = reply.send(response);
            }
            Task::VoteResponse { from, response } => {
                if self.node.handle_vote_response(from, response) {
                    debug!(term = self.node.current_term, "leadership established");
                }
            }
            Task::AppendResponse { from, response } => {
                self.node.handle_append_entries_response(from, response);
            }
            Task::Command { request, reply } => self.node.submit_command(request, reply),
            Task::Query { request, reply } => self.node.submit_query(request, reply),
            Task::Register { request, reply } => self.node.submit_register(request, reply),
            Task::KeepAlive { request, reply } => self.node.submit_keep_alive(request, reply),
            Task::Unregister { request, reply } => self.node.submit_unregister(request, reply),
            Task::Publish { request, reply } => {
                let _ = reply.send(self.node.publish(request));
            }
            Task::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Task::Shutdown => {}
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.node.id,
            state: self.node.state,
            term: self.node.current_term,
            leader: self.node.leader,
            commit_index: self.node.commit_index,
            last_applied: self.node.last_applied,
            last_log_index: self.node.last_log_index(),
            sessions: self.node.sessions().len(),
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.node.config.random_election_timeout();
    }

    fn flush(&mut self) {
        for message in self.node.take_outbound() {
            if self.outbound.send(message).is_err() {
                trace!("outbound receiver dropped");
                return;
            }
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
