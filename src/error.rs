//! Unified error types for the multiplexer.
//!
//! Errors are scoped the way failures propagate: transport faults are
//! fatal to the protocol that owns the transport, protocol faults are
//! fatal to their phase, and nothing crosses the transport boundary as
//! an error value.

use thiserror::Error;

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel is gone; no further sends are possible.
    #[error("Connection closed.")]
    Closed,
}

/// Protocol-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The transport closed underneath the protocol. Every outstanding
    /// reply is rejected with this reason.
    #[error("Connection closed.")]
    ConnectionClosed,

    /// A reply did not arrive before its deadline. Fatal to the phase:
    /// the transport is closed.
    #[error("timed out after {seconds}s waiting for a reply to `{kind}`")]
    ReplyTimeout {
        /// Payload type of the unanswered request.
        kind: String,
        /// The timeout that fired, in seconds.
        seconds: u64,
    },

    /// The peer broke the phase contract (bad version, malformed reply).
    #[error("protocol violation: {0}")]
    Violation(String),

    /// Outbound middleware dropped the message before it was sent.
    #[error("message dropped before send")]
    Dropped,
}

impl From<TransportError> for ProtocolError {
    fn from(_: TransportError) -> Self {
        ProtocolError::ConnectionClosed
    }
}

/// Host-level failures.
#[derive(Debug, Error)]
pub enum HostError {
    /// The upstream app endpoint could not be reached for a session.
    #[error("failed to open app transport for session `{session_id}`: {reason}")]
    AppConnect {
        /// The session the connection was for.
        session_id: String,
        /// Connector-supplied reason.
        reason: String,
    },
}
