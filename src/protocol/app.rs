//! Session-side phase machine: the session speaking to the app.
//!
//! The same three-phase shape as the client side, run once per session
//! against the app transport. Handshake negotiates versions, sync caches
//! the app's world until the app signals completion, execution routes
//! until the transport dies. Any failure collapses the whole session.

use super::{idle_until, Incoming, PayloadTrace, ProtocolCore, ReplySink};
use crate::error::ProtocolError;
use crate::session::{AppCommand, Session, SessionPhase};
use crate::transport::Transport;
use mremux_proto::{payloads, Message, Payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Drive the app side of one session. Spawned by [`Session::spawn`].
pub(crate) async fn run(
    session: Arc<Session>,
    mut transport: Transport,
    mut commands: mpsc::UnboundedReceiver<AppCommand>,
) {
    match drive(&session, &mut transport, &mut commands).await {
        Ok(()) => info!(session = session.id(), "app connection closed"),
        Err(err) => warn!(session = session.id(), error = %err, "app connection failed"),
    }
    transport.close();
    session.disconnect();
}

async fn drive(
    session: &Arc<Session>,
    transport: &mut Transport,
    commands: &mut mpsc::UnboundedReceiver<AppCommand>,
) -> Result<(), ProtocolError> {
    handshake(session, transport).await?;
    session.set_phase(SessionPhase::Sync);

    sync(session, transport).await?;
    session.set_phase(SessionPhase::Execution);

    execution(session, transport, commands).await
}

/// Negotiate with the app: same initiator shape as the client side.
async fn handshake(session: &Arc<Session>, transport: &mut Transport) -> Result<(), ProtocolError> {
    let mut core =
        ProtocolCore::new("session-handshake", transport.sender()).with_middleware(Arc::new(PayloadTrace));
    let config = session.config();

    let (reply_tx, mut reply_rx) = oneshot::channel();
    core.send_request(
        Message::request(
            Payload::new(payloads::HANDSHAKE)
                .with("protocolVersion", config.protocol_version)
                .with("sessionId", session.id()),
        ),
        ReplySink::Channel(reply_tx),
        Some(Duration::from_secs(config.handshake_timeout_secs)),
    )?;

    let reply = loop {
        let deadline = core.next_deadline();
        tokio::select! {
            outcome = &mut reply_rx => {
                break outcome.map_err(|_| ProtocolError::ConnectionClosed)??;
            }
            event = transport.recv() => match core.handle_event(event) {
                Incoming::Request(message) => {
                    warn!(kind = message.payload.kind(), "unexpected message during app handshake");
                }
                Incoming::Handled => {}
                Incoming::Closed => return Err(ProtocolError::ConnectionClosed),
            },
            _ = idle_until(deadline) => {
                if let Some(err) = core.expire() {
                    return Err(err);
                }
            }
        }
    };

    let peer_version = reply.payload.get("protocolVersion").and_then(|v| v.as_u64());
    if peer_version != Some(u64::from(config.protocol_version)) {
        return Err(ProtocolError::Violation(format!(
            "protocol version mismatch: app {:?}, host {}",
            peer_version, config.protocol_version
        )));
    }

    core.send(Message::request(Payload::new(payloads::HANDSHAKE_COMPLETE)))?;
    Ok(())
}

/// Cache the app's world until it signals `sync-complete`.
async fn sync(session: &Arc<Session>, transport: &mut Transport) -> Result<(), ProtocolError> {
    let mut core =
        ProtocolCore::new("session-sync", transport.sender()).with_middleware(Arc::new(PayloadTrace));
    loop {
        let event = transport.recv().await;
        match core.handle_event(event) {
            Incoming::Request(message) if message.payload.kind() == payloads::SYNC_COMPLETE => {
                return Ok(());
            }
            Incoming::Request(message) => session.process_from_app(message, false),
            Incoming::Handled => {}
            Incoming::Closed => return Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Steady state: app events fan out, client traffic forwards upstream
/// with replies routed back to whoever asked.
async fn execution(
    session: &Arc<Session>,
    transport: &mut Transport,
    commands: &mut mpsc::UnboundedReceiver<AppCommand>,
) -> Result<(), ProtocolError> {
    let mut core =
        ProtocolCore::new("session-execution", transport.sender()).with_middleware(Arc::new(PayloadTrace));
    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            event = transport.recv() => match core.handle_event(event) {
                Incoming::Request(message) => session.process_from_app(message, true),
                Incoming::Handled => {}
                Incoming::Closed => return Ok(()),
            },
            command = commands.recv() => match command {
                Some(AppCommand::Forward { message, reply_to }) => match reply_to {
                    Some(target) => core.send_request(message, ReplySink::forward(target), None)?,
                    None => core.send(message)?,
                },
                None => return Ok(()),
            },
            _ = idle_until(deadline) => {
                if let Some(err) = core.expire() {
                    return Err(err);
                }
            }
        }
    }
}
