//! # publisher
//!
//! why: deliver state machine events to clients in order, resending rather than skipping
//! relations: owned by the leader state in node.rs; reads the SessionTable, writes Outbound
//! what: EventPublisher (leader side), EventWatermark and Delivery (client side ordering)

use std::collections::HashMap;

use tracing::{trace, warn};

use crate::message::{Outbound, PublishResponse, SessionId};
use crate::session::SessionTable;

/// Tracks how far each session's events have been sent.
///
/// Sending is not acknowledgment: the session's watermark only moves when the
/// client confirms receipt, and anything past the watermark may be sent again.
#[derive(Debug, Default)]
pub struct EventPublisher {
    sent: HashMap<SessionId, i64>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence sent to `session`, if anything was sent yet.
    pub fn sent(&self, session: SessionId) -> Option<i64> {
        self.sent.get(&session).copied()
    }

    /// Build a delivery for every pending event that has not been sent yet.
    pub fn publish(&mut self, sessions: &SessionTable) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        for session in sessions.iter() {
            let sent = self.sent.entry(session.id()).or_insert(session.event_ack());
            for event in session.pending_events() {
                if event.sequence <= *sent {
                    continue;
                }
                let response = match PublishResponse::publish_ok(event.version, event.sequence) {
                    Ok(response) => response,
                    Err(error) => {
                        warn!(session = session.id(), %error, "skipping malformed event");
                        continue;
                    }
                };
                trace!(
                    session = session.id(),
                    version = event.version,
                    sequence = event.sequence,
                    "publishing event"
                );
                outbound.push(Outbound::Publish {
                    session: session.id(),
                    response,
                    event: event.payload.clone(),
                });
                *sent = event.sequence;
            }
        }
        outbound
    }

    /// Rewind the send cursor so everything after `sequence` goes out again.
    pub fn resend_from(&mut self, session: SessionId, sequence: i64) {
        if let Some(sent) = self.sent.get_mut(&session) {
            if sequence < *sent {
                *sent = sequence;
            }
        }
    }

    pub fn forget(&mut self, session: SessionId) {
        self.sent.remove(&session);
    }
}

/// What a client should do with a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Next in order: hand it to the application and acknowledge it.
    Accepted,
    /// Already delivered, or carries no event. Drop it.
    Duplicate,
    /// An earlier event was lost. Drop it and report the unchanged watermark
    /// so the leader resends from there.
    Gap,
}

/// Client-side filter that only lets events through in sequence order.
///
/// The watermark is the last event handed to the application and never
/// skips a sequence, so acknowledging it never drops an undelivered event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventWatermark {
    sequence: i64,
}

impl EventWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn accept(&mut self, response: &PublishResponse) -> Delivery {
        match response.sequence() {
            Some(sequence) if sequence == self.sequence + 1 => {
                self.sequence = sequence;
                Delivery::Accepted
            }
            Some(sequence) if sequence > self.sequence + 1 => Delivery::Gap,
            _ => Delivery::Duplicate,
        }
    }
}
