//! # sequencer
//!
//! why: append each session's commands in sequence order no matter how they arrive
//! relations: owned by the leader state in node.rs; fed by client.rs, drained on step-down
//! what: CommandSequencer, PendingCommand, Submission

use std::collections::{BTreeMap, HashMap};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ErrorKind;
use crate::message::{CommandRequest, CommandResponse, Response, SessionId};

/// A command waiting to be appended, with every caller waiting on it.
///
/// Retries of a command that is still held collapse into one entry with
/// several reply channels.
#[derive(Debug)]
pub struct PendingCommand {
    pub request: CommandRequest,
    pub replies: Vec<oneshot::Sender<CommandResponse>>,
}

impl PendingCommand {
    pub fn new(request: CommandRequest, reply: oneshot::Sender<CommandResponse>) -> Self {
        Self {
            request,
            replies: vec![reply],
        }
    }

    pub fn fail(self, kind: ErrorKind) {
        for reply in self.replies {
            let _ = reply.send(Response::Error(kind));
        }
    }
}

/// What the leader must do with a submitted command.
#[derive(Debug)]
pub enum Submission {
    /// Append these commands, in this order
    Ready(Vec<PendingCommand>),
    /// Held until its predecessors arrive
    Held,
    /// Already appended at `index`; wait on that entry instead
    InFlight {
        index: u64,
        command: PendingCommand,
    },
    /// At or below what was sequenced but no longer tracked; answer from the session
    Stale(PendingCommand),
}

/// Orders commands per session by sequence number.
#[derive(Debug, Default)]
pub struct CommandSequencer {
    /// Highest sequence appended to the log, per session
    sequenced: HashMap<SessionId, u64>,
    /// Commands that arrived ahead of a predecessor
    held: HashMap<SessionId, BTreeMap<u64, PendingCommand>>,
    /// Appended but not yet applied, keyed by (session, sequence)
    in_flight: HashMap<(SessionId, u64), u64>,
}

impl CommandSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command that is already in the log, e.g. one left uncommitted by
    /// a previous leader.
    pub fn seed(&mut self, session: SessionId, sequence: u64, index: u64) {
        let sequenced = self.sequenced.entry(session).or_insert(0);
        *sequenced = (*sequenced).max(sequence);
        self.in_flight.insert((session, sequence), index);
    }

    /// Highest sequence appended for `session`, if any command was sequenced.
    pub fn sequenced(&self, session: SessionId) -> Option<u64> {
        self.sequenced.get(&session).copied()
    }

    pub fn held_count(&self, session: SessionId) -> usize {
        self.held.get(&session).map(BTreeMap::len).unwrap_or(0)
    }

    /// Submit a command whose session has applied up to `applied`.
    pub fn submit(&mut self, applied: u64, command: PendingCommand) -> Submission {
        let session = command.request.session;
        let sequence = command.request.sequence;
        let next = self.sequenced.entry(session).or_insert(applied);
        *next = (*next).max(applied);

        if sequence <= *next {
            return match self.in_flight.get(&(session, sequence)) {
                Some(&index) => Submission::InFlight { index, command },
                None => Submission::Stale(command),
            };
        }

        if sequence > *next + 1 {
            debug!(session, sequence, expected = *next + 1, "holding out-of-order command");
            let held = self.held.entry(session).or_default();
            match held.get_mut(&sequence) {
                Some(existing) => existing.replies.extend(command.replies),
                None => {
                    held.insert(sequence, command);
                }
            }
            return Submission::Held;
        }

        *next = sequence;
        let mut ready = vec![command];
        if let Some(held) = self.held.get_mut(&session) {
            while let Some(command) = held.remove(&(*next + 1)) {
                *next += 1;
                ready.push(command);
            }
            if held.is_empty() {
                self.held.remove(&session);
            }
        }
        Submission::Ready(ready)
    }

    /// Note the log index a ready command was appended at.
    pub fn appended(&mut self, session: SessionId, sequence: u64, index: u64) {
        self.in_flight.insert((session, sequence), index);
    }

    /// Forget an in-flight command once it has been applied.
    pub fn applied(&mut self, session: SessionId, sequence: u64) {
        self.in_flight.remove(&(session, sequence));
    }

    /// Drop everything tracked for a closed session, returning held commands.
    pub fn forget(&mut self, session: SessionId) -> Vec<PendingCommand> {
        self.sequenced.remove(&session);
        self.in_flight.retain(|(owner, _), _| *owner != session);
        self.held
            .remove(&session)
            .map(|held| held.into_values().collect())
            .unwrap_or_default()
    }

    /// Drop all state, returning every held command.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        self.sequenced.clear();
        self.in_flight.clear();
        self.held
            .drain()
            .flat_map(|(_, held)| held.into_values())
            .collect()
    }
}
