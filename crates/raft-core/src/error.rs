//! # error
//!
//! why: separate errors that travel over the wire from errors that stay local
//! relations: ErrorKind is embedded in every Response; BuildError/CodecError come from message.rs and codec.rs
//! what: ErrorKind (stable wire ids), BuildError, CodecError, NodeError

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::log::LogError;

/// Error kinds carried in the ERROR branch of a response envelope.
///
/// The numeric ids are part of the wire contract and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The receiving node is not the leader; the client must redirect.
    NoLeader,
    /// A query could not be evaluated.
    QueryError,
    /// A command could not be served, e.g. its cached result was already released.
    CommandError,
    /// The state machine failed while applying a command.
    ApplicationError,
    /// The session is unknown or has expired; the client must re-register.
    UnknownSession,
    /// The request violated the replication protocol.
    ProtocolError,
    /// A local fault such as a storage failure.
    InternalError,
}

impl ErrorKind {
    pub fn id(self) -> u8 {
        match self {
            ErrorKind::NoLeader => 1,
            ErrorKind::QueryError => 2,
            ErrorKind::CommandError => 3,
            ErrorKind::ApplicationError => 4,
            ErrorKind::UnknownSession => 5,
            ErrorKind::ProtocolError => 6,
            ErrorKind::InternalError => 7,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            1 => ErrorKind::NoLeader,
            2 => ErrorKind::QueryError,
            3 => ErrorKind::CommandError,
            4 => ErrorKind::ApplicationError,
            5 => ErrorKind::UnknownSession,
            6 => ErrorKind::ProtocolError,
            7 => ErrorKind::InternalError,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NoLeader => "no leader",
            ErrorKind::QueryError => "query error",
            ErrorKind::CommandError => "command error",
            ErrorKind::ApplicationError => "application error",
            ErrorKind::UnknownSession => "unknown session",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Raised when a message is built with out-of-range fields.
///
/// This is a local programming defect, never a distributed condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("version cannot be less than 0 (got {0})")]
    NegativeVersion(i64),
    #[error("sequence cannot be less than 0 (got {0})")]
    NegativeSequence(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated")]
    Truncated,
    #[error("unknown response status {0}")]
    UnknownStatus(u8),
    #[error("unknown error kind {0}")]
    UnknownErrorKind(u8),
    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },
    #[error("invalid field: {0}")]
    Invalid(#[from] BuildError),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("length {0} does not fit a u32 prefix")]
    TooLarge(usize),
}

/// Raised when a node cannot be constructed.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to restore vote: {0}")]
    Log(#[from] LogError),
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
}
