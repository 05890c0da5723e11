//! Send/recv middleware.
//!
//! Middleware runs in order around every message a protocol sends or
//! receives. A hook may rewrite the message or drop it by returning
//! `None`. Drops are silent by design: outbound, the core rejects any
//! attached reply sink so no caller waits forever; inbound, the message
//! simply never reaches correlation or dispatch.

use mremux_proto::Message;
use tracing::debug;

/// Hook pair run around every protocol message.
pub trait Middleware: Send + Sync {
    /// Runs before a message leaves. `None` drops it.
    fn before_send(&self, _protocol: &'static str, message: Message) -> Option<Message> {
        Some(message)
    }

    /// Runs before a received message is correlated or dispatched.
    /// `None` drops it.
    fn before_recv(&self, _protocol: &'static str, message: Message) -> Option<Message> {
        Some(message)
    }
}

/// Debug-logs every envelope crossing the protocol.
pub struct PayloadTrace;

impl Middleware for PayloadTrace {
    fn before_send(&self, protocol: &'static str, message: Message) -> Option<Message> {
        debug!(
            protocol,
            kind = message.payload.kind(),
            id = %message.id,
            reply_to = ?message.reply_to_id,
            "send"
        );
        Some(message)
    }

    fn before_recv(&self, protocol: &'static str, message: Message) -> Option<Message> {
        debug!(
            protocol,
            kind = message.payload.kind(),
            id = %message.id,
            reply_to = ?message.reply_to_id,
            "recv"
        );
        Some(message)
    }
}
