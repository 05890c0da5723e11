//! The message envelope.
//!
//! Every frame on every transport is one [`Message`]. A message carrying
//! `replyToId` is a *reply*; everything else is a *request*. Ids are
//! random 128-bit strings, assigned lazily so constructors stay cheap and
//! the sending protocol remains the single id authority.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A single framed message: id, optional reply correlation, payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id. Empty until [`Message::ensure_id`] runs;
    /// the send path assigns it just before the frame leaves.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Id of the request this message answers, when it is a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,

    /// The typed payload.
    pub payload: Payload,
}

impl Message {
    /// A fresh request carrying `payload`. The id is assigned on send.
    pub fn request(payload: Payload) -> Self {
        Self {
            id: String::new(),
            reply_to_id: None,
            payload,
        }
    }

    /// A reply to the request with id `request_id`.
    pub fn reply_to(request_id: &str, payload: Payload) -> Self {
        Self {
            id: String::new(),
            reply_to_id: Some(request_id.to_string()),
            payload,
        }
    }

    /// Whether this message answers an earlier request.
    pub fn is_reply(&self) -> bool {
        self.reply_to_id.is_some()
    }

    /// Assign a random id when none is present yet, returning the id.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        &self.id
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a message from its JSON wire form.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A `type`-tagged JSON payload.
///
/// The tag selects the handling rule; every other field rides along in
/// `fields` untouched. On the wire the tag and the fields are flattened
/// into one object: `{"type": "actor-update", "actor": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    kind: String,

    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Payload {
    /// An empty payload of the given type.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The payload type tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// A field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// A field by name, mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.fields.get_mut(key)
    }

    /// Insert or replace a field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// A string-valued field by name.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// All fields besides the type tag.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// All fields besides the type tag, mutably.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }
}
