//! A scripted engine client.

#![allow(dead_code)]

use anyhow::{bail, Result};
use mremux::proto::{payloads, Message, Payload, PROTOCOL_VERSION};
use mremux::transport::{Transport, TransportEvent};
use serde_json::{json, Value};
use tokio::time::timeout;

/// One engine client, driven directly by the test.
pub struct TestEngine {
    transport: Transport,
}

impl TestEngine {
    /// Wrap the engine-side endpoint of a transport pair.
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Receive the next message, failing on close or timeout.
    pub async fn recv(&mut self) -> Result<Message> {
        match timeout(super::RECV_TIMEOUT, self.transport.recv()).await? {
            TransportEvent::Message(message) => Ok(message),
            other => bail!("expected message, transport yielded {other:?}"),
        }
    }

    /// Receive the next message and assert its payload type.
    pub async fn recv_kind(&mut self, kind: &str) -> Result<Message> {
        let message = self.recv().await?;
        if message.payload.kind() != kind {
            bail!("expected `{kind}`, got `{}`", message.payload.kind());
        }
        Ok(message)
    }

    /// Expect the transport to close.
    pub async fn expect_closed(&mut self) -> Result<()> {
        match timeout(super::RECV_TIMEOUT, self.transport.recv()).await? {
            TransportEvent::Closed | TransportEvent::Error(_) => Ok(()),
            TransportEvent::Message(message) => {
                bail!("expected close, got `{}`", message.payload.kind())
            }
        }
    }

    /// Send a message, assigning an id when absent. Returns the id.
    pub fn send(&self, mut message: Message) -> Result<String> {
        let id = message.ensure_id().to_string();
        self.transport.send(message)?;
        Ok(id)
    }

    /// Send a fresh request carrying `payload`. Returns the id.
    pub fn send_payload(&self, payload: Payload) -> Result<String> {
        self.send(Message::request(payload))
    }

    /// Reply to `request`.
    pub fn reply(&self, request: &Message, payload: Payload) -> Result<()> {
        let mut reply = Message::reply_to(&request.id, payload);
        reply.ensure_id();
        self.transport.send(reply)?;
        Ok(())
    }

    /// Answer the session's handshake (optionally naming a user) and
    /// consume `handshake-complete`.
    pub async fn complete_handshake(&mut self, user_id: Option<&str>) -> Result<()> {
        let handshake = self.recv_kind(payloads::HANDSHAKE).await?;
        let mut payload =
            Payload::new(payloads::HANDSHAKE_REPLY).with("protocolVersion", PROTOCOL_VERSION);
        if let Some(user_id) = user_id {
            payload = payload.with("userId", user_id);
        }
        self.reply(&handshake, payload)?;
        self.recv_kind(payloads::HANDSHAKE_COMPLETE).await?;
        Ok(())
    }

    /// Consume the world replay until `sync-complete`, answering every
    /// request that expects a reply the way a real engine would.
    /// Returns the replay in arrival order.
    pub async fn complete_sync(&mut self) -> Result<Vec<Message>> {
        let mut replay = Vec::new();
        loop {
            let message = self.recv().await?;
            match message.payload.kind() {
                payloads::SYNC_COMPLETE => break,
                payloads::CREATE_ASSET | payloads::LOAD_ASSETS => {
                    self.reply(&message, assets_loaded_for(&message))?;
                    replay.push(message);
                }
                payloads::HEARTBEAT => {
                    self.reply(&message, Payload::new(payloads::OPERATION_RESULT))?;
                    replay.push(message);
                }
                _ => replay.push(message),
            }
        }
        Ok(replay)
    }

    /// Handshake and sync in one step. Returns the replay.
    pub async fn join(&mut self, user_id: Option<&str>) -> Result<Vec<Message>> {
        self.complete_handshake(user_id).await?;
        self.complete_sync().await
    }

    /// Close the engine's transport.
    pub fn close(&self) {
        self.transport.close();
    }
}

/// The `assets-loaded` answer a real engine would give: the asset named
/// by a `create-asset` definition, or an empty batch for loads whose
/// contents the test does not model.
pub fn assets_loaded_for(request: &Message) -> Payload {
    let assets: Value = match request
        .payload
        .get("definition")
        .and_then(|definition| definition.get("id"))
    {
        Some(id) => json!([{"id": id}]),
        None => json!([]),
    };
    Payload::new(payloads::ASSETS_LOADED).with("assets", assets)
}
