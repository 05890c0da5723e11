//! mremux - session multiplexer for mixed-reality extension hosts.
//!
//! A session sits between one *app* endpoint (the logical simulation
//! server, upstream) and any number of *engine clients* (renderers,
//! downstream) sharing a world. The multiplexer brings each newly
//! arriving client up to the live world by replaying a merged cache of
//! mutations, forwards real-time traffic in both directions under a
//! request/reply protocol with correlation and timeouts, and keeps one
//! client elected *authoritative* so exactly one set of peer statistics
//! reaches the app.
//!
//! Layering, leaves first:
//!
//! ```text
//! transport        typed message channels + byte-stats tap
//!    |
//! protocol         send/recv core: middleware, reply map, deadlines
//!    |             phase loops: handshake -> sync -> execution
//! session          clients, sync cache, rules table, election
//!    |
//! host             session table keyed by the transport's session header
//! ```
//!
//! Transports are abstracted: anything that can deliver ordered, framed
//! [`proto::Message`] envelopes works. An in-memory pair ships for tests
//! and in-process apps, and a WebSocket adapter bridges
//! `tokio-tungstenite` streams.

mod config;
mod error;
mod host;

pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{ConfigError, MuxConfig};
pub use error::{HostError, ProtocolError, TransportError};
pub use host::{AppConnector, SessionHost};
pub use mremux_proto as proto;
pub use session::{Session, SessionPhase};
pub use transport::{Transport, TransportEvent, TransportSender};
