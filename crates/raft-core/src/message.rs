//! # message
//!
//! why: define all rpc message types for node-to-node and client-to-node communication
//! relations: produced and consumed by node.rs and server.rs, encoded by codec.rs
//! what: Response envelope, Vote/Append/Register/KeepAlive/Unregister/Command/Query/Publish pairs, Outbound

use crate::error::{BuildError, ErrorKind};
use crate::log::LogEntry;

pub type NodeId = u64;
pub type SessionId = u64;

/// Envelope status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    pub fn id(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Error => 1,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Status::Ok),
            1 => Some(Status::Error),
            _ => None,
        }
    }
}

/// Response envelope shared by every rpc.
///
/// The OK branch carries only the fields valid for that rpc; the error branch
/// carries only the error kind. Neither can be populated alongside the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response<T> {
    Ok(T),
    Error(ErrorKind),
}

impl<T> Response<T> {
    pub fn status(&self) -> Status {
        match self {
            Response::Ok(_) => Status::Ok,
            Response::Error(_) => Status::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn ok(&self) -> Option<&T> {
        match self {
            Response::Ok(value) => Some(value),
            Response::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            Response::Ok(_) => None,
            Response::Error(kind) => Some(*kind),
        }
    }

    pub fn into_result(self) -> Result<T, ErrorKind> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Error(kind) => Err(kind),
        }
    }
}

impl<T> From<Result<T, ErrorKind>> for Response<T> {
    fn from(result: Result<T, ErrorKind>) -> Self {
        match result {
            Ok(value) => Response::Ok(value),
            Err(kind) => Response::Error(kind),
        }
    }
}

// -- vote --

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub term: u64,
    pub voted: bool,
}

pub type VoteResponse = Response<Vote>;

// -- append --

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: u64,
    pub leader: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
    /// Leader's broadcast counter; echoed back so reads can confirm leadership
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub term: u64,
    pub succeeded: bool,
    /// On success, the last index known to match the leader; on failure, a
    /// hint for where the leader should retry from.
    pub last_log_index: u64,
    /// The `round` of the request being answered
    pub round: u64,
}

pub type AppendResponse = Response<Appended>;

// -- sessions --

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub client: u64,
    /// Requested session timeout in milliseconds; 0 picks the server default
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub session: SessionId,
    pub leader: NodeId,
    pub members: Vec<NodeId>,
    pub timeout: u64,
}

pub type RegisterResponse = Response<Registered>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveRequest {
    pub session: SessionId,
    /// Highest command sequence whose response the client has received
    pub command_sequence: u64,
    /// Highest event sequence the client has received
    pub event_sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeptAlive {
    pub leader: NodeId,
    pub members: Vec<NodeId>,
}

pub type KeepAliveResponse = Response<KeptAlive>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterRequest {
    pub session: SessionId,
}

pub type UnregisterResponse = Response<()>;

// -- commands and queries --

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub session: SessionId,
    pub sequence: u64,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Log index the command was committed at
    pub index: u64,
    pub result: Vec<u8>,
}

pub type CommandResponse = Response<CommandOutput>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Served by any node once it has applied the client's last seen index
    #[default]
    Sequential,
    /// Served by the leader once it has applied everything committed at receipt
    Linearizable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub session: SessionId,
    /// Highest index the client has observed
    pub index: u64,
    pub consistency: Consistency,
    pub query: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutput {
    /// Applied index the query was evaluated at
    pub index: u64,
    pub result: Vec<u8>,
}

pub type QueryResponse = Response<QueryOutput>;

// -- publish --

/// Client acknowledgment of received events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub session: SessionId,
    /// Highest event sequence received
    pub event_sequence: i64,
}

/// Version and sequence of a single published event.
///
/// Fields are private so the only way to build one is through [`PublishAck::new`],
/// which rejects negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    version: i64,
    sequence: i64,
}

impl PublishAck {
    pub fn new(version: i64, sequence: i64) -> Result<Self, BuildError> {
        if version < 0 {
            return Err(BuildError::NegativeVersion(version));
        }
        if sequence < 0 {
            return Err(BuildError::NegativeSequence(sequence));
        }
        Ok(Self { version, sequence })
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

pub type PublishResponse = Response<PublishAck>;

impl Response<PublishAck> {
    /// Build an OK publish response, validating version and sequence.
    pub fn publish_ok(version: i64, sequence: i64) -> Result<Self, BuildError> {
        PublishAck::new(version, sequence).map(Response::Ok)
    }

    pub fn version(&self) -> Option<i64> {
        self.ok().map(PublishAck::version)
    }

    pub fn sequence(&self) -> Option<i64> {
        self.ok().map(PublishAck::sequence)
    }
}

/// Traffic the node wants delivered; drained by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Vote { to: NodeId, request: VoteRequest },
    Append { to: NodeId, request: AppendRequest },
    /// A single ordered event for a client session
    Publish {
        session: SessionId,
        response: PublishResponse,
        event: Vec<u8>,
    },
}

/// All protocol messages behind one type, for transports with a single frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendRequest(AppendRequest),
    AppendResponse(AppendResponse),
    RegisterRequest(RegisterRequest),
    RegisterResponse(RegisterResponse),
    KeepAliveRequest(KeepAliveRequest),
    KeepAliveResponse(KeepAliveResponse),
    UnregisterRequest(UnregisterRequest),
    UnregisterResponse(UnregisterResponse),
    CommandRequest(CommandRequest),
    CommandResponse(CommandResponse),
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
    PublishRequest(PublishRequest),
    PublishResponse(PublishResponse),
}
