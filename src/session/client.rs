//! Per-client records owned by the session.

use crate::protocol::ReplySink;
use crate::transport::TransportSender;
use mremux_proto::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Lifecycle phase of one engine client connection. Phases only ever
/// advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientPhase {
    /// Exchanging protocol version and user identity.
    Handshake,
    /// Receiving the world replay.
    Sync,
    /// Steady-state bidirectional forwarding.
    Execution,
    /// The transport is gone.
    Closed,
}

// Join-order counter, process-wide; the authoritative-election tie break.
static NEXT_ORDER: AtomicU64 = AtomicU64::new(1);

/// A message parked for a client that has not reached execution yet.
#[derive(Debug)]
pub struct QueuedMessage {
    /// The envelope to send.
    pub message: Message,
    /// Reply completion to register when the message finally goes out.
    pub sink: Option<ReplySink>,
    /// Reply deadline, counted from the actual send.
    pub timeout: Option<Duration>,
}

/// Instruction for a client connection task.
#[derive(Debug)]
pub enum ClientCommand {
    /// Send through the client's active protocol.
    Send {
        /// The envelope to send.
        message: Message,
        /// Reply completion, when one is expected.
        sink: Option<ReplySink>,
        /// Reply deadline.
        timeout: Option<Duration>,
    },
    /// Close the client's transport and end its task.
    Close,
}

/// The session-side record of one engine client.
pub(crate) struct ClientRecord {
    pub id: String,
    pub order: u64,
    pub user_id: Option<String>,
    pub authoritative: bool,
    /// Set once this client's sync snapshot has been taken; queue rules
    /// stop deferring to the replay from that point on.
    pub snapshot_taken: bool,
    pub queued: VecDeque<QueuedMessage>,
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    pub sender: TransportSender,
    phase: watch::Sender<ClientPhase>,
}

impl ClientRecord {
    pub fn new(sender: TransportSender, commands: mpsc::UnboundedSender<ClientCommand>) -> Self {
        let (phase, _) = watch::channel(ClientPhase::Handshake);
        Self {
            id: Uuid::new_v4().to_string(),
            order: NEXT_ORDER.fetch_add(1, Ordering::Relaxed),
            user_id: None,
            authoritative: false,
            snapshot_taken: false,
            queued: VecDeque::new(),
            commands,
            sender,
            phase,
        }
    }

    pub fn phase(&self) -> ClientPhase {
        *self.phase.borrow()
    }

    /// Advance the phase. Regressions are ignored: phases are monotonic.
    pub fn set_phase(&self, next: ClientPhase) {
        self.phase.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    pub fn phase_watch(&self) -> watch::Receiver<ClientPhase> {
        self.phase.subscribe()
    }

    /// Remove and return the queued messages selected by `predicate`,
    /// preserving enqueue order; the rest stay for later drainage waves.
    pub fn filter_queued(
        &mut self,
        predicate: impl Fn(&Message) -> bool,
    ) -> Vec<QueuedMessage> {
        let mut kept = VecDeque::new();
        let mut taken = Vec::new();
        for queued in self.queued.drain(..) {
            if predicate(&queued.message) {
                taken.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        self.queued = kept;
        taken
    }
}

/// Point-in-time public view of one client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Random client id.
    pub id: String,
    /// Process-wide join order; the election tie break.
    pub order: u64,
    /// User identity from the handshake, when known.
    pub user_id: Option<String>,
    /// Whether this client's stats are the ones forwarded upstream.
    pub authoritative: bool,
    /// Current lifecycle phase.
    pub phase: ClientPhase,
}

impl ClientRecord {
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            order: self.order,
            user_id: self.user_id.clone(),
            authoritative: self.authoritative,
            phase: self.phase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pair;
    use mremux_proto::Payload;

    fn record() -> ClientRecord {
        let (left, _right) = pair();
        let (commands, _rx) = mpsc::unbounded_channel();
        ClientRecord::new(left.sender(), commands)
    }

    #[test]
    fn order_is_monotonic_across_records() {
        let first = record();
        let second = record();
        assert!(second.order > first.order);
    }

    #[test]
    fn phase_never_regresses() {
        let client = record();
        client.set_phase(ClientPhase::Execution);
        client.set_phase(ClientPhase::Sync);
        assert_eq!(client.phase(), ClientPhase::Execution);
        client.set_phase(ClientPhase::Closed);
        assert_eq!(client.phase(), ClientPhase::Closed);
    }

    #[test]
    fn filter_queued_preserves_order_and_remainder() {
        let mut client = record();
        for kind in ["a", "b", "a", "c"] {
            client.queued.push_back(QueuedMessage {
                message: Message::request(Payload::new(kind)),
                sink: None,
                timeout: None,
            });
        }
        let taken = client.filter_queued(|m| m.payload.kind() == "a");
        assert_eq!(taken.len(), 2);
        let rest: Vec<&str> = client.queued.iter().map(|q| q.message.payload.kind()).collect();
        assert_eq!(rest, ["b", "c"]);
    }
}
