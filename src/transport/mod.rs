//! Transport adapter: typed, ordered, message-framed channels.
//!
//! The multiplexer consumes transports through two halves, mirroring
//! how the connection tasks are organized:
//!
//! - [`Transport`] is the receiving half, owned by exactly one
//!   connection task which drives `recv` in its phase loop;
//! - [`TransportSender`] is the clonable sending half the session keeps
//!   for routing, closing, and stats access.
//!
//! `send` never suspends: frames are enqueued in order and drained by
//! the peer (or the pump task bridging to a real socket). Closing either
//! half delivers a final [`TransportEvent::Closed`] to both sides.

mod stats;
pub mod ws;

pub use stats::StatsTracker;

use crate::error::TransportError;
use mremux_proto::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One event from the peer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A framed message arrived.
    Message(Message),
    /// The peer closed the channel (or we did).
    Closed,
    /// The channel failed; treated like a close by every consumer.
    Error(String),
}

/// Receiving half of a transport. Owned by one connection task.
pub struct Transport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    sender: TransportSender,
    headers: HashMap<String, String>,
}

impl Transport {
    /// The next event. Yields `Closed` forever once the channel is gone.
    pub async fn recv(&mut self) -> TransportEvent {
        if self.sender.is_closed() {
            return TransportEvent::Closed;
        }
        match self.events.recv().await {
            Some(TransportEvent::Message(message)) => {
                self.sender.stats.record_incoming(frame_len(&message));
                TransportEvent::Message(message)
            }
            Some(event) => {
                self.sender.mark_closed();
                event
            }
            None => {
                self.sender.mark_closed();
                TransportEvent::Closed
            }
        }
    }

    /// A clone of the sending half.
    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// Send a message to the peer.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.sender.send(message)
    }

    /// Close both directions.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Transport-attached headers (the session id lives here).
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Attach a header (used by adapters while wiring a connection).
    pub fn insert_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// The byte-stats tap for this endpoint.
    pub fn stats(&self) -> &Arc<StatsTracker> {
        self.sender.stats()
    }
}

/// Clonable sending half of a transport.
#[derive(Clone, Debug)]
pub struct TransportSender {
    to_peer: mpsc::UnboundedSender<TransportEvent>,
    to_self: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
    stats: Arc<StatsTracker>,
}

impl TransportSender {
    /// Enqueue a message for the peer. Never suspends.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.stats.record_outgoing(frame_len(&message));
        self.to_peer
            .send(TransportEvent::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    /// Close both directions. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.to_peer.send(TransportEvent::Closed);
            let _ = self.to_self.send(TransportEvent::Closed);
        }
    }

    /// Fail the transport, delivering a reason to both sides.
    pub fn fail(&self, reason: impl Into<String>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let reason = reason.into();
            let _ = self.to_peer.send(TransportEvent::Error(reason.clone()));
            let _ = self.to_self.send(TransportEvent::Error(reason));
        }
    }

    /// Whether the transport has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The byte-stats tap for this endpoint.
    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Serialized frame length, used for stats accounting on both paths.
fn frame_len(message: &Message) -> u64 {
    message.encode().map(|text| text.len() as u64).unwrap_or(0)
}

/// An in-memory connected pair of endpoints.
///
/// Reliable, ordered, message-framed: exactly the channel contract the
/// protocol layer assumes. Used by tests and by in-process apps; socket
/// adapters bridge one endpoint of a pair to the wire.
pub fn pair() -> (Transport, Transport) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    let left = Transport {
        events: left_rx,
        sender: TransportSender {
            to_peer: right_tx.clone(),
            to_self: left_tx.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsTracker::default()),
        },
        headers: HashMap::new(),
    };
    let right = Transport {
        events: right_rx,
        sender: TransportSender {
            to_peer: left_tx,
            to_self: right_tx,
            closed: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsTracker::default()),
        },
        headers: HashMap::new(),
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mremux_proto::Payload;

    fn heartbeat() -> Message {
        Message::request(Payload::new("heartbeat"))
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (left, mut right) = pair();
        for n in 0..3 {
            let mut msg = heartbeat();
            msg.id = format!("m{n}");
            left.send(msg).unwrap();
        }
        for n in 0..3 {
            match right.recv().await {
                TransportEvent::Message(msg) => assert_eq!(msg.id, format!("m{n}")),
                other => panic!("expected message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn close_reaches_both_sides_and_sticks() {
        let (left, mut right) = pair();
        left.close();
        assert!(matches!(right.recv().await, TransportEvent::Closed));
        assert!(matches!(right.recv().await, TransportEvent::Closed));
        assert!(left.send(heartbeat()).is_err());
        assert!(right.send(heartbeat()).is_err());
    }

    #[tokio::test]
    async fn stats_count_both_directions() {
        let (left, mut right) = pair();
        left.send(heartbeat()).unwrap();
        let TransportEvent::Message(_) = right.recv().await else {
            panic!("expected message");
        };
        assert!(left.stats().outgoing_bytes() > 0);
        assert_eq!(left.stats().incoming_bytes(), 0);
        assert_eq!(right.stats().incoming_bytes(), left.stats().outgoing_bytes());
    }

    #[tokio::test]
    async fn fail_carries_the_reason() {
        let (left, mut right) = pair();
        left.sender().fail("socket reset");
        match right.recv().await {
            TransportEvent::Error(reason) => assert_eq!(reason, "socket reset"),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
