//! # state_machine
//!
//! why: apply committed entries deterministically and keep session bookkeeping beside them
//! relations: driven by the commit pipeline in commit.rs; owns the SessionTable
//! what: StateMachine trait, Commit and QueryContext, StateMachineExecutor, Applied

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::log::{LogEntry, Operation};
use crate::message::{CommandOutput, QueryOutput, SessionId};
use crate::session::{CommandResult, Session, SessionTable};

/// Failure reported by user state machine code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// User state machine. `apply` must be deterministic: every replica calls it
/// with the same commits in the same order.
pub trait StateMachine {
    fn apply(&mut self, commit: &mut Commit<'_>) -> Result<Vec<u8>, ApplyError>;

    fn query(&self, query: &QueryContext<'_>) -> Result<Vec<u8>, ApplyError>;
}

/// A committed command being applied.
#[derive(Debug)]
pub struct Commit<'a> {
    index: u64,
    session: SessionId,
    sequence: u64,
    timestamp: u64,
    operation: &'a [u8],
    events: Vec<(SessionId, Vec<u8>)>,
}

impl<'a> Commit<'a> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn operation(&self) -> &'a [u8] {
        self.operation
    }

    /// Publish an event to the session that submitted this command.
    pub fn publish(&mut self, event: Vec<u8>) {
        self.events.push((self.session, event));
    }

    /// Publish an event to another session.
    pub fn publish_to(&mut self, session: SessionId, event: Vec<u8>) {
        self.events.push((session, event));
    }
}

/// A read-only query against applied state.
#[derive(Debug)]
pub struct QueryContext<'a> {
    pub session: SessionId,
    /// Applied index the query observes
    pub index: u64,
    pub query: &'a [u8],
}

/// What applying one entry produced, handed back to whoever waits on its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    NoOp,
    Registered { session: SessionId, timeout: u64 },
    KeptAlive(Result<(), ErrorKind>),
    Unregistered(Result<(), ErrorKind>),
    Command {
        session: SessionId,
        sequence: u64,
        result: CommandResult,
    },
}

/// Runs the state machine and owns the session table.
#[derive(Debug)]
pub struct StateMachineExecutor<S> {
    state_machine: S,
    sessions: SessionTable,
}

impl<S: StateMachine> StateMachineExecutor<S> {
    pub fn new(state_machine: S) -> Self {
        Self {
            state_machine,
            sessions: SessionTable::new(),
        }
    }

    pub fn state_machine(&self) -> &S {
        &self.state_machine
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }

    /// Expire sessions whose keep-alive lapsed by `timestamp`.
    pub fn expire(&mut self, timestamp: u64) -> Vec<SessionId> {
        let expired = self.sessions.expire(timestamp);
        for session in &expired {
            debug!(session, timestamp, "session expired");
        }
        expired
    }

    /// Apply one committed entry.
    pub fn apply(&mut self, entry: &LogEntry) -> Applied {
        match &entry.operation {
            Operation::NoOp => Applied::NoOp,
            Operation::Register {
                client,
                timeout,
                timestamp,
            } => {
                self.sessions
                    .register(Session::new(entry.index, *client, *timeout, *timestamp));
                debug!(session = entry.index, client, "session registered");
                Applied::Registered {
                    session: entry.index,
                    timeout: *timeout,
                }
            }
            Operation::KeepAlive {
                session,
                command_sequence,
                event_sequence,
                timestamp,
            } => {
                let Some(record) = self.sessions.get_mut(*session) else {
                    return Applied::KeptAlive(Err(ErrorKind::UnknownSession));
                };
                record.touch(*timestamp);
                record.release_results(*command_sequence);
                record.acknowledge_events(*event_sequence);
                Applied::KeptAlive(Ok(()))
            }
            Operation::Unregister { session, .. } => match self.sessions.remove(*session) {
                Some(_) => {
                    debug!(session, "session unregistered");
                    Applied::Unregistered(Ok(()))
                }
                None => Applied::Unregistered(Err(ErrorKind::UnknownSession)),
            },
            Operation::Command {
                session,
                sequence,
                timestamp,
                payload,
            } => {
                let result = self.apply_command(entry.index, *session, *sequence, *timestamp, payload);
                Applied::Command {
                    session: *session,
                    sequence: *sequence,
                    result,
                }
            }
        }
    }

    fn apply_command(
        &mut self,
        index: u64,
        session: SessionId,
        sequence: u64,
        timestamp: u64,
        payload: &[u8],
    ) -> CommandResult {
        let Some(record) = self.sessions.get_mut(session) else {
            return Err(ErrorKind::UnknownSession);
        };
        if sequence <= record.command_sequence() {
            // already applied; never run it twice
            return record
                .cached_result(sequence)
                .cloned()
                .unwrap_or(Err(ErrorKind::CommandError));
        }
        record.touch(timestamp);

        let mut commit = Commit {
            index,
            session,
            sequence,
            timestamp,
            operation: payload,
            events: Vec::new(),
        };
        let result = match self.state_machine.apply(&mut commit) {
            Ok(output) => Ok(CommandOutput {
                index,
                result: output,
            }),
            Err(error) => {
                warn!(index, session, sequence, %error, "command failed to apply");
                Err(ErrorKind::ApplicationError)
            }
        };

        for (recipient, event) in commit.events {
            if self.sessions.publish(recipient, event).is_none() {
                debug!(recipient, index, "dropping event for closed session");
            }
        }
        if let Some(record) = self.sessions.get_mut(session) {
            record.record_result(sequence, result.clone());
        }
        result
    }

    pub fn query(
        &self,
        session: SessionId,
        index: u64,
        query: &[u8],
    ) -> Result<QueryOutput, ErrorKind> {
        if !self.sessions.contains(session) {
            return Err(ErrorKind::UnknownSession);
        }
        let context = QueryContext {
            session,
            index,
            query,
        };
        match self.state_machine.query(&context) {
            Ok(result) => Ok(QueryOutput { index, result }),
            Err(error) => {
                debug!(session, index, %error, "query failed");
                Err(ErrorKind::QueryError)
            }
        }
    }
}
