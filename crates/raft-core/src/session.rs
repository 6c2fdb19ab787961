//! # session
//!
//! why: track per-client state that makes commands exactly-once and events gap-free
//! relations: owned by StateMachineExecutor; read by the sequencer and publisher in node.rs
//! what: Session, Event, SessionTable with deterministic expiry and event numbering

use std::collections::{BTreeMap, VecDeque};

use crate::error::ErrorKind;
use crate::message::{CommandOutput, SessionId};

/// Outcome of a command, cached until the client acknowledges it.
pub type CommandResult = Result<CommandOutput, ErrorKind>;

/// An event waiting for client acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub version: i64,
    pub sequence: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    client: u64,
    timeout: u64,
    last_keep_alive: u64,
    command_sequence: u64,
    results: BTreeMap<u64, CommandResult>,
    event_sequence: i64,
    event_ack: i64,
    acked_version: i64,
    events: VecDeque<Event>,
}

impl Session {
    pub fn new(id: SessionId, client: u64, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            client,
            timeout,
            last_keep_alive: timestamp,
            command_sequence: 0,
            results: BTreeMap::new(),
            event_sequence: 0,
            event_ack: 0,
            acked_version: 0,
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client(&self) -> u64 {
        self.client
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    /// Highest command sequence applied to the state machine.
    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    /// Sequence of the most recently published event.
    pub fn event_sequence(&self) -> i64 {
        self.event_sequence
    }

    /// Delivery watermark: highest event sequence the client acknowledged.
    pub fn event_ack(&self) -> i64 {
        self.event_ack
    }

    /// Version of the event at the delivery watermark.
    pub fn acked_version(&self) -> i64 {
        self.acked_version
    }

    pub fn pending_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn cached_result(&self, sequence: u64) -> Option<&CommandResult> {
        self.results.get(&sequence)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.last_keep_alive.saturating_add(self.timeout)
    }

    pub(crate) fn touch(&mut self, timestamp: u64) {
        self.last_keep_alive = self.last_keep_alive.max(timestamp);
    }

    pub(crate) fn record_result(&mut self, sequence: u64, result: CommandResult) {
        self.command_sequence = self.command_sequence.max(sequence);
        self.results.insert(sequence, result);
    }

    /// Drop cached results the client has confirmed receiving.
    pub(crate) fn release_results(&mut self, upto: u64) {
        match upto.checked_add(1) {
            Some(first_kept) => self.results = self.results.split_off(&first_kept),
            None => self.results.clear(),
        }
    }

    /// Advance the delivery watermark. Never moves backwards; returns whether it moved.
    pub(crate) fn acknowledge_events(&mut self, sequence: i64) -> bool {
        let sequence = sequence.min(self.event_sequence);
        if sequence <= self.event_ack {
            return false;
        }
        while let Some(event) = self.events.front() {
            if event.sequence > sequence {
                break;
            }
            self.acked_version = event.version;
            self.events.pop_front();
        }
        self.event_ack = sequence;
        true
    }

    fn push_event(&mut self, version: i64, payload: Vec<u8>) -> &Event {
        self.event_sequence += 1;
        self.events.push_back(Event {
            version,
            sequence: self.event_sequence,
            payload,
        });
        &self.events[self.events.len() - 1]
    }
}

/// All open sessions on a node, ordered by id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
    event_version: i64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) {
        self.sessions.insert(session.id(), session);
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Version assigned to the most recent event across all sessions.
    pub fn event_version(&self) -> i64 {
        self.event_version
    }

    /// Remove sessions whose keep-alive lapsed at `now`, returning their ids.
    pub fn expire(&mut self, now: u64) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(Session::id)
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }

    /// Queue an event for a session, tagging it with the next version and the
    /// session's next sequence. Returns `None` if the session is gone.
    pub fn publish(&mut self, id: SessionId, payload: Vec<u8>) -> Option<&Event> {
        let session = self.sessions.get_mut(&id)?;
        self.event_version += 1;
        Some(session.push_event(self.event_version, payload))
    }
}
