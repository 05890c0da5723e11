//! Protocol base: the send/recv machinery every phase runs on.
//!
//! Each connection phase owns a [`ProtocolCore`]. The core assigns
//! message ids, runs the middleware chain, tracks outstanding replies
//! with per-request deadlines, correlates incoming replies to their
//! sinks, and sweeps everything when the transport closes.
//!
//! The phase loops themselves live in [`client`] and [`app`]: explicit
//! `select!` loops over transport events, command channels, and the
//! earliest reply deadline. Phase completion is a transition edge, not a
//! poll: a phase that has finished its work keeps consuming events until
//! the pending map is empty (the drain), then returns.

mod middleware;

pub mod app;
pub mod client;

pub use middleware::{Middleware, PayloadTrace};

use crate::error::ProtocolError;
use crate::transport::{TransportEvent, TransportSender};
use mremux_proto::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{error, warn};

/// Outcome delivered to a reply sink: the reply message, or the reason
/// the request will never be answered.
pub type ReplyOutcome = Result<Message, ProtocolError>;

/// Completion attached to an outgoing request.
pub enum ReplySink {
    /// Wake an awaiting receiver.
    Channel(oneshot::Sender<ReplyOutcome>),
    /// Run a continuation with the outcome.
    Callback(Box<dyn FnOnce(ReplyOutcome) + Send>),
    /// A reply is expected on the wire but deliberately ignored.
    Discard,
}

impl ReplySink {
    /// A sink that re-delivers the raw reply envelope to another
    /// transport — the cross-multiplexer correlation path.
    pub fn forward(target: TransportSender) -> Self {
        ReplySink::Callback(Box::new(move |outcome| {
            if let Ok(reply) = outcome {
                let _ = target.send(reply);
            }
        }))
    }

    pub(crate) fn complete(self, outcome: ReplyOutcome) {
        match self {
            ReplySink::Channel(tx) => {
                let _ = tx.send(outcome);
            }
            ReplySink::Callback(run) => run(outcome),
            ReplySink::Discard => {}
        }
    }
}

impl std::fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplySink::Channel(_) => f.write_str("ReplySink::Channel"),
            ReplySink::Callback(_) => f.write_str("ReplySink::Callback"),
            ReplySink::Discard => f.write_str("ReplySink::Discard"),
        }
    }
}

struct Pending {
    sink: ReplySink,
    deadline: Option<Instant>,
    timeout_secs: u64,
    kind: String,
}

/// What [`ProtocolCore::handle_event`] resolved an inbound event into.
#[derive(Debug)]
pub enum Incoming {
    /// A request for the phase loop to dispatch.
    Request(Message),
    /// Consumed internally: a correlated reply, or a middleware drop.
    Handled,
    /// The transport is gone; every pending reply has been rejected.
    Closed,
}

/// Per-phase protocol state: send side, middleware, outstanding replies.
pub struct ProtocolCore {
    name: &'static str,
    sender: TransportSender,
    middleware: Vec<Arc<dyn Middleware>>,
    pending: HashMap<String, Pending>,
}

impl ProtocolCore {
    /// A fresh core for one phase over `sender`'s transport.
    pub fn new(name: &'static str, sender: TransportSender) -> Self {
        Self {
            name,
            sender,
            middleware: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Append a middleware to the chain.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// The phase name, used in diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The transport's sending half.
    pub fn sender(&self) -> &TransportSender {
        &self.sender
    }

    /// Send a fire-and-forget message.
    pub fn send(&mut self, message: Message) -> Result<(), ProtocolError> {
        self.send_with(message, None, None)
    }

    /// Send a request and register its reply sink. When `timeout` is
    /// set and fires, the sink is rejected, the transport closed, and
    /// the phase fails.
    pub fn send_request(
        &mut self,
        message: Message,
        sink: ReplySink,
        timeout: Option<Duration>,
    ) -> Result<(), ProtocolError> {
        self.send_with(message, Some(sink), timeout)
    }

    fn send_with(
        &mut self,
        mut message: Message,
        sink: Option<ReplySink>,
        timeout: Option<Duration>,
    ) -> Result<(), ProtocolError> {
        message.ensure_id();
        for middleware in &self.middleware {
            message = match middleware.before_send(self.name, message) {
                Some(message) => message,
                None => {
                    // The middleware owns the drop; reject the sink so
                    // no caller waits forever.
                    if let Some(sink) = sink {
                        sink.complete(Err(ProtocolError::Dropped));
                    }
                    return Ok(());
                }
            };
        }

        let id = message.id.clone();
        let kind = message.payload.kind().to_string();
        match self.sender.send(message) {
            Ok(()) => {
                if let Some(sink) = sink {
                    self.pending.insert(
                        id,
                        Pending {
                            sink,
                            deadline: timeout.map(|t| Instant::now() + t),
                            timeout_secs: timeout.map(|t| t.as_secs()).unwrap_or(0),
                            kind,
                        },
                    );
                }
                Ok(())
            }
            Err(err) => {
                if let Some(sink) = sink {
                    sink.complete(Err(ProtocolError::ConnectionClosed));
                }
                Err(err.into())
            }
        }
    }

    /// Feed one transport event through middleware and correlation.
    pub fn handle_event(&mut self, event: TransportEvent) -> Incoming {
        match event {
            TransportEvent::Message(mut message) => {
                for middleware in &self.middleware {
                    message = match middleware.before_recv(self.name, message) {
                        Some(message) => message,
                        None => return Incoming::Handled,
                    };
                }
                if let Some(reply_to) = message.reply_to_id.clone() {
                    match self.pending.remove(&reply_to) {
                        Some(pending) => pending.sink.complete(Ok(message)),
                        None => error!(
                            protocol = self.name,
                            reply_to = %reply_to,
                            kind = message.payload.kind(),
                            "reply does not correlate to any outstanding request"
                        ),
                    }
                    Incoming::Handled
                } else {
                    Incoming::Request(message)
                }
            }
            TransportEvent::Closed => {
                self.reject_all();
                Incoming::Closed
            }
            TransportEvent::Error(reason) => {
                warn!(protocol = self.name, %reason, "transport error");
                self.reject_all();
                Incoming::Closed
            }
        }
    }

    /// The earliest reply deadline, if any request carries one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|p| p.deadline).min()
    }

    /// Fire every due deadline: reject the sink, close the transport.
    /// Returns the fatal error when at least one fired.
    pub fn expire(&mut self) -> Option<ProtocolError> {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        let mut fatal = None;
        for id in due {
            if let Some(pending) = self.pending.remove(&id) {
                let err = ProtocolError::ReplyTimeout {
                    kind: pending.kind.clone(),
                    seconds: pending.timeout_secs,
                };
                error!(
                    protocol = self.name,
                    kind = %pending.kind,
                    seconds = pending.timeout_secs,
                    "reply timed out; closing transport"
                );
                pending.sink.complete(Err(err.clone()));
                fatal.get_or_insert(err);
            }
        }
        if fatal.is_some() {
            self.sender.close();
        }
        fatal
    }

    /// Reject every outstanding reply with `"Connection closed."`.
    pub fn reject_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.sink.complete(Err(ProtocolError::ConnectionClosed));
        }
    }

    /// Whether any reply is still outstanding (the drain condition).
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Sleep until `deadline`, or forever when there is none. Lets phase
/// loops fold "no deadline" into one `select!` arm.
pub(crate) async fn idle_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
