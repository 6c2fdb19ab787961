//! # log
//!
//! why: manage the append-only log of operations that raft replicates
//! relations: used by node.rs for replication, implemented durably by raftline-storage
//! what: LogEntry, Operation, the Log collaborator trait, MemoryLog

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The operation carried by a log entry.
///
/// Timestamps are leader wall-clock milliseconds. They are replicated with the
/// entry so every replica expires sessions at the same log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Appended by each new leader to commit entries left over from earlier terms
    NoOp,
    /// Opens a session; the session id is the index of this entry
    Register { client: u64, timeout: u64, timestamp: u64 },
    /// Refreshes a session and acknowledges command results and events
    KeepAlive {
        session: u64,
        command_sequence: u64,
        event_sequence: i64,
        timestamp: u64,
    },
    /// Closes a session
    Unregister { session: u64, timestamp: u64 },
    /// A client command for the state machine
    Command {
        session: u64,
        sequence: u64,
        timestamp: u64,
        payload: Vec<u8>,
    },
}

impl Operation {
    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Operation::NoOp => None,
            Operation::Register { timestamp, .. }
            | Operation::KeepAlive { timestamp, .. }
            | Operation::Unregister { timestamp, .. }
            | Operation::Command { timestamp, .. } => Some(*timestamp),
        }
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The operation to be applied once committed
    pub operation: Operation,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, operation: Operation) -> Self {
        Self {
            term,
            index,
            operation,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable log collaborator.
///
/// Indices are dense and start at 1; index 0 means "before the first entry" and
/// always has term 0. The current term and vote live next to the log because
/// they must be durable before a node answers any vote.
pub trait Log {
    /// Append an operation at `last_index() + 1`, returning its index.
    fn append(&mut self, term: u64, operation: Operation) -> Result<u64, LogError>;

    fn get(&self, index: u64) -> Option<LogEntry>;

    /// Drop every entry with an index greater than `index`.
    fn truncate_after(&mut self, index: u64) -> Result<(), LogError>;

    fn last_index(&self) -> u64;

    fn last_term(&self) -> u64;

    fn save_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), LogError>;

    fn load_vote(&self) -> Result<(u64, Option<u64>), LogError>;

    /// Term of the entry at `index`, or 0 when there is no such entry.
    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.get(index).map(|entry| entry.term).unwrap_or(0)
    }

    /// Up to `max` consecutive entries starting at `from`.
    fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let from = from.max(1);
        (from..=self.last_index())
            .take(max)
            .map_while(|index| self.get(index))
            .collect()
    }
}

/// Volatile log used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
    term: u64,
    voted_for: Option<u64>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Log for MemoryLog {
    fn append(&mut self, term: u64, operation: Operation) -> Result<u64, LogError> {
        let index = self.entries.len() as u64 + 1;
        self.entries.push(LogEntry::new(term, index, operation));
        Ok(index)
    }

    fn get(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1).cloned()
    }

    fn truncate_after(&mut self, index: u64) -> Result<(), LogError> {
        self.entries.truncate(index as usize);
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    fn save_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), LogError> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_vote(&self) -> Result<(u64, Option<u64>), LogError> {
        Ok((self.term, self.voted_for))
    }
}
