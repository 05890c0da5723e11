//! A scripted upstream app endpoint.

#![allow(dead_code)]

use anyhow::{bail, Result};
use mremux::proto::{payloads, Message, Payload, PROTOCOL_VERSION};
use mremux::transport::{Transport, TransportEvent};
use tokio::time::timeout;

/// The app side of a session, driven directly by the test.
pub struct TestApp {
    transport: Transport,
}

impl TestApp {
    /// Wrap the app-side endpoint of a transport pair.
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

    /// Answer the session's handshake, stream `world`, and close the
    /// sync phase. The standard opening move of nearly every test.
    pub async fn serve_preamble(&mut self, world: Vec<Message>) -> Result<()> {
        let handshake = self.recv_kind(payloads::HANDSHAKE).await?;
        self.reply(
            &handshake,
            Payload::new(payloads::HANDSHAKE_REPLY).with("protocolVersion", PROTOCOL_VERSION),
        )?;
        self.recv_kind(payloads::HANDSHAKE_COMPLETE).await?;

        for message in world {
            self.send(message)?;
        }
        self.send_payload(Payload::new(payloads::SYNC_COMPLETE))?;
        Ok(())
    }

    /// Close the app transport.
    pub fn close(&self) {
        self.transport.close();
    }
}
