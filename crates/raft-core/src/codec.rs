//! # codec
//!
//! why: give every protocol message a fixed big-endian binary layout
//! relations: encodes the types in message.rs and log.rs; framing is left to the transport
//! what: Wire trait, per-message layouts, RaftMessage type tags

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, ErrorKind};
use crate::log::{LogEntry, Operation};
use crate::message::*;

/// Binary encoding used on the wire.
///
/// Integers are big-endian. Byte strings and lists are prefixed with a `u32`
/// length.
pub trait Wire: Sized {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError>;

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError>;

    fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete message, rejecting trailing bytes.
    fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let value = Self::decode(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(CodecError::TrailingBytes(bytes.len()));
        }
        Ok(value)
    }
}

fn need<B: Buf>(buf: &B, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(())
}

fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u32<B: Buf>(buf: &mut B) -> Result<u32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_i64<B: Buf>(buf: &mut B) -> Result<i64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

fn get_bool<B: Buf>(buf: &mut B) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        tag => Err(CodecError::UnknownTag { what: "bool", tag }),
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
    buf.put_u32(len);
    Ok(())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), CodecError> {
    put_len(buf, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

fn get_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, CodecError> {
    let len = get_u32(buf)? as usize;
    need(buf, len)?;
    let mut bytes = vec![0; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn put_members(buf: &mut BytesMut, members: &[NodeId]) -> Result<(), CodecError> {
    put_len(buf, members.len())?;
    for member in members {
        buf.put_u64(*member);
    }
    Ok(())
}

fn get_members<B: Buf>(buf: &mut B) -> Result<Vec<NodeId>, CodecError> {
    let len = get_u32(buf)? as usize;
    need(buf, len.saturating_mul(8))?;
    Ok((0..len).map(|_| buf.get_u64()).collect())
}

impl<T: Wire> Wire for Response<T> {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.status().id());
        match self {
            Response::Ok(value) => value.encode(buf),
            Response::Error(kind) => {
                buf.put_u8(kind.id());
                Ok(())
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let status = get_u8(buf)?;
        match Status::from_id(status) {
            Some(Status::Ok) => Ok(Response::Ok(T::decode(buf)?)),
            Some(Status::Error) => {
                let id = get_u8(buf)?;
                let kind = ErrorKind::from_id(id).ok_or(CodecError::UnknownErrorKind(id))?;
                Ok(Response::Error(kind))
            }
            None => Err(CodecError::UnknownStatus(status)),
        }
    }
}

impl Wire for () {
    fn encode(&self, _buf: &mut BytesMut) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode<B: Buf>(_buf: &mut B) -> Result<Self, CodecError> {
        Ok(())
    }
}

impl Wire for Operation {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Operation::NoOp => buf.put_u8(0),
            Operation::Register {
                client,
                timeout,
                timestamp,
            } => {
                buf.put_u8(1);
                buf.put_u64(*client);
                buf.put_u64(*timeout);
                buf.put_u64(*timestamp);
            }
            Operation::KeepAlive {
                session,
                command_sequence,
                event_sequence,
                timestamp,
            } => {
                buf.put_u8(2);
                buf.put_u64(*session);
                buf.put_u64(*command_sequence);
                buf.put_i64(*event_sequence);
                buf.put_u64(*timestamp);
            }
            Operation::Unregister { session, timestamp } => {
                buf.put_u8(3);
                buf.put_u64(*session);
                buf.put_u64(*timestamp);
            }
            Operation::Command {
                session,
                sequence,
                timestamp,
                payload,
            } => {
                buf.put_u8(4);
                buf.put_u64(*session);
                buf.put_u64(*sequence);
                buf.put_u64(*timestamp);
                put_bytes(buf, payload)?;
            }
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(match get_u8(buf)? {
            0 => Operation::NoOp,
            1 => Operation::Register {
                client: get_u64(buf)?,
                timeout: get_u64(buf)?,
                timestamp: get_u64(buf)?,
            },
            2 => Operation::KeepAlive {
                session: get_u64(buf)?,
                command_sequence: get_u64(buf)?,
                event_sequence: get_i64(buf)?,
                timestamp: get_u64(buf)?,
            },
            3 => Operation::Unregister {
                session: get_u64(buf)?,
                timestamp: get_u64(buf)?,
            },
            4 => Operation::Command {
                session: get_u64(buf)?,
                sequence: get_u64(buf)?,
                timestamp: get_u64(buf)?,
                payload: get_bytes(buf)?,
            },
            tag => return Err(CodecError::UnknownTag { what: "operation", tag }),
        })
    }
}

impl Wire for LogEntry {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.index);
        buf.put_u64(self.term);
        self.operation.encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let operation = Operation::decode(buf)?;
        Ok(LogEntry::new(term, index, operation))
    }
}

impl Wire for VoteRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.term);
        buf.put_u64(self.candidate);
        buf.put_u64(self.last_log_index);
        buf.put_u64(self.last_log_term);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            term: get_u64(buf)?,
            candidate: get_u64(buf)?,
            last_log_index: get_u64(buf)?,
            last_log_term: get_u64(buf)?,
        })
    }
}

impl Wire for Vote {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.term);
        buf.put_u8(self.voted as u8);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            term: get_u64(buf)?,
            voted: get_bool(buf)?,
        })
    }
}

impl Wire for AppendRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.term);
        buf.put_u64(self.leader);
        buf.put_u64(self.prev_log_index);
        buf.put_u64(self.prev_log_term);
        buf.put_u64(self.commit_index);
        buf.put_u64(self.round);
        put_len(buf, self.entries.len())?;
        for entry in &self.entries {
            entry.encode(buf)?;
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let term = get_u64(buf)?;
        let leader = get_u64(buf)?;
        let prev_log_index = get_u64(buf)?;
        let prev_log_term = get_u64(buf)?;
        let commit_index = get_u64(buf)?;
        let round = get_u64(buf)?;
        let count = get_u32(buf)? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            entries.push(LogEntry::decode(buf)?);
        }
        Ok(Self {
            term,
            leader,
            prev_log_index,
            prev_log_term,
            entries,
            commit_index,
            round,
        })
    }
}

impl Wire for Appended {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.term);
        buf.put_u8(self.succeeded as u8);
        buf.put_u64(self.last_log_index);
        buf.put_u64(self.round);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            term: get_u64(buf)?,
            succeeded: get_bool(buf)?,
            last_log_index: get_u64(buf)?,
            round: get_u64(buf)?,
        })
    }
}

impl Wire for RegisterRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.client);
        buf.put_u64(self.timeout);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            client: get_u64(buf)?,
            timeout: get_u64(buf)?,
        })
    }
}

impl Wire for Registered {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.session);
        buf.put_u64(self.leader);
        put_members(buf, &self.members)?;
        buf.put_u64(self.timeout);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            session: get_u64(buf)?,
            leader: get_u64(buf)?,
            members: get_members(buf)?,
            timeout: get_u64(buf)?,
        })
    }
}

impl Wire for KeepAliveRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.session);
        buf.put_u64(self.command_sequence);
        buf.put_i64(self.event_sequence);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            session: get_u64(buf)?,
            command_sequence: get_u64(buf)?,
            event_sequence: get_i64(buf)?,
        })
    }
}

impl Wire for KeptAlive {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.leader);
        put_members(buf, &self.members)?;
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            leader: get_u64(buf)?,
            members: get_members(buf)?,
        })
    }
}

impl Wire for UnregisterRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.session);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            session: get_u64(buf)?,
        })
    }
}

impl Wire for CommandRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.session);
        buf.put_u64(self.sequence);
        put_bytes(buf, &self.command)?;
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            session: get_u64(buf)?,
            sequence: get_u64(buf)?,
            command: get_bytes(buf)?,
        })
    }
}

impl Wire for CommandOutput {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.index);
        put_bytes(buf, &self.result)?;
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            index: get_u64(buf)?,
            result: get_bytes(buf)?,
        })
    }
}

impl Wire for QueryRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.session);
        buf.put_u64(self.index);
        buf.put_u8(match self.consistency {
            Consistency::Sequential => 0,
            Consistency::Linearizable => 1,
        });
        put_bytes(buf, &self.query)?;
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let session = get_u64(buf)?;
        let index = get_u64(buf)?;
        let consistency = match get_u8(buf)? {
            0 => Consistency::Sequential,
            1 => Consistency::Linearizable,
            tag => return Err(CodecError::UnknownTag { what: "consistency", tag }),
        };
        Ok(Self {
            session,
            index,
            consistency,
            query: get_bytes(buf)?,
        })
    }
}

impl Wire for QueryOutput {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.index);
        put_bytes(buf, &self.result)?;
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            index: get_u64(buf)?,
            result: get_bytes(buf)?,
        })
    }
}

impl Wire for PublishRequest {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u64(self.session);
        buf.put_i64(self.event_sequence);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            session: get_u64(buf)?,
            event_sequence: get_i64(buf)?,
        })
    }
}

impl Wire for PublishAck {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        // re-checked so a corrupted value can never reach the wire
        let ack = PublishAck::new(self.version(), self.sequence())?;
        buf.put_i64(ack.version());
        buf.put_i64(ack.sequence());
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let version = get_i64(buf)?;
        let sequence = get_i64(buf)?;
        Ok(PublishAck::new(version, sequence)?)
    }
}

impl Wire for RaftMessage {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            RaftMessage::VoteRequest(m) => {
                buf.put_u8(1);
                m.encode(buf)
            }
            RaftMessage::VoteResponse(m) => {
                buf.put_u8(2);
                m.encode(buf)
            }
            RaftMessage::AppendRequest(m) => {
                buf.put_u8(3);
                m.encode(buf)
            }
            RaftMessage::AppendResponse(m) => {
                buf.put_u8(4);
                m.encode(buf)
            }
            RaftMessage::RegisterRequest(m) => {
                buf.put_u8(5);
                m.encode(buf)
            }
            RaftMessage::RegisterResponse(m) => {
                buf.put_u8(6);
                m.encode(buf)
            }
            RaftMessage::KeepAliveRequest(m) => {
                buf.put_u8(7);
                m.encode(buf)
            }
            RaftMessage::KeepAliveResponse(m) => {
                buf.put_u8(8);
                m.encode(buf)
            }
            RaftMessage::UnregisterRequest(m) => {
                buf.put_u8(9);
                m.encode(buf)
            }
            RaftMessage::UnregisterResponse(m) => {
                buf.put_u8(10);
                m.encode(buf)
            }
            RaftMessage::CommandRequest(m) => {
                buf.put_u8(11);
                m.encode(buf)
            }
            RaftMessage::CommandResponse(m) => {
                buf.put_u8(12);
                m.encode(buf)
            }
            RaftMessage::QueryRequest(m) => {
                buf.put_u8(13);
                m.encode(buf)
            }
            RaftMessage::QueryResponse(m) => {
                buf.put_u8(14);
                m.encode(buf)
            }
            RaftMessage::PublishRequest(m) => {
                buf.put_u8(15);
                m.encode(buf)
            }
            RaftMessage::PublishResponse(m) => {
                buf.put_u8(16);
                m.encode(buf)
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(match get_u8(buf)? {
            1 => RaftMessage::VoteRequest(Wire::decode(buf)?),
            2 => RaftMessage::VoteResponse(Wire::decode(buf)?),
            3 => RaftMessage::AppendRequest(Wire::decode(buf)?),
            4 => RaftMessage::AppendResponse(Wire::decode(buf)?),
            5 => RaftMessage::RegisterRequest(Wire::decode(buf)?),
            6 => RaftMessage::RegisterResponse(Wire::decode(buf)?),
            7 => RaftMessage::KeepAliveRequest(Wire::decode(buf)?),
            8 => RaftMessage::KeepAliveResponse(Wire::decode(buf)?),
            9 => RaftMessage::UnregisterRequest(Wire::decode(buf)?),
            10 => RaftMessage::UnregisterResponse(Wire::decode(buf)?),
            11 => RaftMessage::CommandRequest(Wire::decode(buf)?),
            12 => RaftMessage::CommandResponse(Wire::decode(buf)?),
            13 => RaftMessage::QueryRequest(Wire::decode(buf)?),
            14 => RaftMessage::QueryResponse(Wire::decode(buf)?),
            15 => RaftMessage::PublishRequest(Wire::decode(buf)?),
            16 => RaftMessage::PublishResponse(Wire::decode(buf)?),
            tag => return Err(CodecError::UnknownTag { what: "message", tag }),
        })
    }
}
