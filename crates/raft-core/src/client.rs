//! # client
//!
//! why: accept client session traffic on the leader and route it through the log
//! relations: extends RaftNode from node.rs; replies are completed by commit.rs
//! what: command, query, register, keep_alive, unregister and publish entry points

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::commit::{PendingQuery, Waiter};
use crate::error::ErrorKind;
use crate::log::{Log, Operation};
use crate::message::{
    CommandRequest, CommandResponse, Consistency, KeepAliveRequest, KeepAliveResponse,
    PublishRequest, PublishResponse, QueryRequest, QueryResponse, RegisterRequest,
    RegisterResponse, Response, SessionId, UnregisterRequest, UnregisterResponse,
};
use crate::node::{NodeState, RaftNode};
use crate::sequencer::{PendingCommand, Submission};
use crate::state_machine::StateMachine;

impl<L: Log, S: StateMachine> RaftNode<L, S> {
    /// Submit a command; the receiver resolves once it is applied.
    pub fn command(&mut self, request: CommandRequest) -> oneshot::Receiver<CommandResponse> {
        let (reply, response) = oneshot::channel();
        self.submit_command(request, reply);
        response
    }

    pub fn submit_command(
        &mut self,
        request: CommandRequest,
        reply: oneshot::Sender<CommandResponse>,
    ) {
        if self.state != NodeState::Leader {
            let _ = reply.send(Response::Error(ErrorKind::NoLeader));
            return;
        }
        let Some(session) = self.executor.sessions().get(request.session) else {
            let _ = reply.send(Response::Error(ErrorKind::UnknownSession));
            return;
        };

        let applied = session.command_sequence();
        if request.sequence <= applied {
            debug!(session = request.session, sequence = request.sequence, "answering duplicate command from cache");
            let cached = session
                .cached_result(request.sequence)
                .cloned()
                .unwrap_or(Err(ErrorKind::CommandError));
            let _ = reply.send(cached.into());
            return;
        }

        let Some(leader_state) = self.leader_state.as_mut() else {
            let _ = reply.send(Response::Error(ErrorKind::NoLeader));
            return;
        };
        let (session, sequence) = (request.session, request.sequence);
        match leader_state
            .sequencer
            .submit(applied, PendingCommand::new(request, reply))
        {
            Submission::Ready(ready) => self.append_commands(ready),
            Submission::Held => {}
            Submission::InFlight { index, command } => {
                debug!(session, sequence, index, "command retry attached to in-flight entry");
                self.waiters
                    .entry(index)
                    .or_default()
                    .extend(command.replies.into_iter().map(Waiter::Command));
            }
            Submission::Stale(command) => {
                let cached = self
                    .executor
                    .sessions()
                    .get(session)
                    .and_then(|record| record.cached_result(sequence))
                    .cloned()
                    .unwrap_or(Err(ErrorKind::CommandError));
                for reply in command.replies {
                    let _ = reply.send(cached.clone().into());
                }
            }
        }
    }

    fn append_commands(&mut self, ready: Vec<PendingCommand>) {
        let timestamp = self.now;
        let mut ready = ready.into_iter();
        while let Some(PendingCommand { request, replies }) = ready.next() {
            let CommandRequest {
                session,
                sequence,
                command,
            } = request;
            let operation = Operation::Command {
                session,
                sequence,
                timestamp,
                payload: command,
            };
            match self.log.append(self.current_term, operation) {
                Ok(index) => {
                    debug!(node_id = self.id, session, sequence, index, "command sequenced");
                    if let Some(leader_state) = self.leader_state.as_mut() {
                        leader_state.sequencer.appended(session, sequence, index);
                    }
                    self.waiters
                        .entry(index)
                        .or_default()
                        .extend(replies.into_iter().map(Waiter::Command));
                }
                Err(error) => {
                    // later sequences cannot be appended past the gap
                    warn!(node_id = self.id, session, sequence, %error, "failed to append command");
                    for reply in replies {
                        let _ = reply.send(Response::Error(ErrorKind::InternalError));
                    }
                    for command in ready.by_ref() {
                        command.fail(ErrorKind::InternalError);
                    }
                    if let Some(leader_state) = self.leader_state.as_mut() {
                        for command in leader_state.sequencer.forget(session) {
                            command.fail(ErrorKind::InternalError);
                        }
                    }
                }
            }
        }
        self.replicate();
    }

    /// Submit a query; the receiver resolves once the read index is applied.
    pub fn query(&mut self, request: QueryRequest) -> oneshot::Receiver<QueryResponse> {
        let (reply, response) = oneshot::channel();
        self.submit_query(request, reply);
        response
    }

    pub fn submit_query(&mut self, request: QueryRequest, reply: oneshot::Sender<QueryResponse>) {
        let (read_index, round) = match request.consistency {
            Consistency::Sequential => (request.index, 0),
            Consistency::Linearizable => {
                let Some(leader_state) = self.leader_state.as_ref() else {
                    let _ = reply.send(Response::Error(ErrorKind::NoLeader));
                    return;
                };
                let read_index = self
                    .commit_index
                    .max(leader_state.noop_index)
                    .max(request.index);
                // answered only after a quorum acks the broadcast below
                (read_index, leader_state.round + 1)
            }
        };
        self.queries.push(PendingQuery {
            read_index,
            round,
            request,
            reply,
        });
        if round > 0 {
            self.replicate();
        }
        self.serve_queries();
    }

    /// Open a session. The session id is the index of its register entry.
    pub fn register(&mut self, request: RegisterRequest) -> oneshot::Receiver<RegisterResponse> {
        let (reply, response) = oneshot::channel();
        self.submit_register(request, reply);
        response
    }

    pub fn submit_register(
        &mut self,
        request: RegisterRequest,
        reply: oneshot::Sender<RegisterResponse>,
    ) {
        let timeout = match request.timeout {
            0 => self.config.session_timeout,
            timeout => timeout,
        };
        let operation = Operation::Register {
            client: request.client,
            timeout,
            timestamp: self.now,
        };
        match self.append_client_operation(operation) {
            Ok(index) => {
                self.waiters
                    .entry(index)
                    .or_default()
                    .push(Waiter::Register(reply));
                self.replicate();
            }
            Err(kind) => {
                let _ = reply.send(Response::Error(kind));
            }
        }
    }

    /// Refresh a session and acknowledge command results and events.
    pub fn keep_alive(&mut self, request: KeepAliveRequest) -> oneshot::Receiver<KeepAliveResponse> {
        let (reply, response) = oneshot::channel();
        self.submit_keep_alive(request, reply);
        response
    }

    pub fn submit_keep_alive(
        &mut self,
        request: KeepAliveRequest,
        reply: oneshot::Sender<KeepAliveResponse>,
    ) {
        if self.state == NodeState::Leader && !self.executor.sessions().contains(request.session) {
            let _ = reply.send(Response::Error(ErrorKind::UnknownSession));
            return;
        }
        let operation = Operation::KeepAlive {
            session: request.session,
            command_sequence: request.command_sequence,
            event_sequence: request.event_sequence,
            timestamp: self.now,
        };
        match self.append_client_operation(operation) {
            Ok(index) => {
                self.waiters
                    .entry(index)
                    .or_default()
                    .push(Waiter::KeepAlive(reply));
                self.acknowledge_events(request.session, request.event_sequence);
                self.replicate();
                self.publish_events();
            }
            Err(kind) => {
                let _ = reply.send(Response::Error(kind));
            }
        }
    }

    /// Close a session.
    pub fn unregister(&mut self, request: UnregisterRequest) -> oneshot::Receiver<UnregisterResponse> {
        let (reply, response) = oneshot::channel();
        self.submit_unregister(request, reply);
        response
    }

    pub fn submit_unregister(
        &mut self,
        request: UnregisterRequest,
        reply: oneshot::Sender<UnregisterResponse>,
    ) {
        if self.state == NodeState::Leader && !self.executor.sessions().contains(request.session) {
            let _ = reply.send(Response::Error(ErrorKind::UnknownSession));
            return;
        }
        let operation = Operation::Unregister {
            session: request.session,
            timestamp: self.now,
        };
        match self.append_client_operation(operation) {
            Ok(index) => {
                self.waiters
                    .entry(index)
                    .or_default()
                    .push(Waiter::Unregister(reply));
                self.replicate();
            }
            Err(kind) => {
                let _ = reply.send(Response::Error(kind));
            }
        }
    }

    /// Handle a client's acknowledgment of received events.
    ///
    /// Moves the leader's watermark at once; the next keep-alive makes it durable.
    pub fn publish(&mut self, request: PublishRequest) -> PublishResponse {
        if self.state != NodeState::Leader {
            return Response::Error(ErrorKind::NoLeader);
        }
        if !self.executor.sessions().contains(request.session) {
            return Response::Error(ErrorKind::UnknownSession);
        }
        self.acknowledge_events(request.session, request.event_sequence);
        let Some(session) = self.executor.sessions().get(request.session) else {
            return Response::Error(ErrorKind::UnknownSession);
        };
        let response = match PublishResponse::publish_ok(session.acked_version(), session.event_ack()) {
            Ok(response) => response,
            Err(error) => {
                warn!(session = request.session, %error, "session watermark is invalid");
                return Response::Error(ErrorKind::InternalError);
            }
        };
        self.publish_events();
        response
    }

    /// Move the leader's event watermark for `session`.
    ///
    /// A report that does not advance the watermark means the client is
    /// stalled or saw a gap, so everything past the watermark goes out again.
    fn acknowledge_events(&mut self, session: SessionId, sequence: i64) {
        let Some(record) = self.executor.sessions_mut().get_mut(session) else {
            return;
        };
        if record.acknowledge_events(sequence) {
            debug!(session, event_ack = record.event_ack(), "events acknowledged");
            return;
        }
        let event_ack = record.event_ack();
        if let Some(leader_state) = self.leader_state.as_mut() {
            trace!(session, event_ack, "watermark did not advance, resending");
            leader_state.publisher.resend_from(session, event_ack);
        }
    }

    fn append_client_operation(&mut self, operation: Operation) -> Result<u64, ErrorKind> {
        if self.state != NodeState::Leader {
            return Err(ErrorKind::NoLeader);
        }
        self.log
            .append(self.current_term, operation)
            .map_err(|error| {
                warn!(node_id = self.id, %error, "failed to append client operation");
                ErrorKind::InternalError
            })
    }
}
