//! # raftline-core
//!
//! why: implement session-aware raft consensus as a sans-I/O core plus a tokio driver
//! relations: used by raftline-storage for a durable log; transports sit outside the crate
//! what: role state machine, command sequencing, session table, event publishing, wire codec

pub mod client;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod publisher;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod state_machine;

pub use codec::Wire;
pub use config::{ConfigError, RaftConfig};
pub use error::{BuildError, CodecError, ErrorKind, NodeError};
pub use log::{Log, LogEntry, LogError, MemoryLog, Operation};
pub use message::{NodeId, Outbound, RaftMessage, Response, SessionId};
pub use node::{LeaderState, NodeState, RaftNode};
pub use publisher::{Delivery, EventPublisher, EventWatermark};
pub use server::{NodeStatus, RaftHandle, RaftServer, ServerError};
pub use session::{Session, SessionTable};
pub use state_machine::{ApplyError, Commit, QueryContext, StateMachine};
