//! # mremux-proto
//!
//! Wire-level types for the mremux session multiplexer: the message
//! envelope exchanged between an app endpoint and its engine clients,
//! the payload-type vocabulary the multiplexer core interprets, and the
//! deep-merge semantics applied to cached world state.
//!
//! The envelope is deliberately small. A [`Message`] is an `id`, an
//! optional `replyToId` correlating it with an earlier request, and a
//! [`Payload`] — a `type`-tagged bag of JSON fields that the routing
//! core treats as opaque beyond its tag.
//!
//! ```rust
//! use mremux_proto::{payloads, Message, Payload};
//!
//! let mut request = Message::request(
//!     Payload::new(payloads::ACTOR_UPDATE).with("actor", serde_json::json!({"id": "a1"})),
//! );
//! request.ensure_id();
//!
//! let reply = Message::reply_to(&request.id, Payload::new(payloads::OPERATION_RESULT));
//! assert!(reply.is_reply());
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod envelope;
pub mod merge;
pub mod types;

pub use envelope::{Message, Payload};
pub use merge::{merge_value, merged};
pub use types::{payloads, PROTOCOL_VERSION, SESSION_ID_HEADER};
