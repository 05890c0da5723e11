//! Client-side phase machine: handshake → sync → execution.
//!
//! One task per engine client drives the three phases in order against
//! the client's transport. Each phase owns a fresh [`ProtocolCore`], so
//! outstanding replies never leak across phase boundaries; a phase that
//! fails closes the transport and the session removes the client.

use super::{idle_until, Incoming, PayloadTrace, ProtocolCore, ReplySink};
use crate::error::ProtocolError;
use crate::session::{ClientCommand, ClientPhase, QueuedMessage, Session};
use crate::transport::Transport;
use mremux_proto::{payloads, Message, Payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Drive one engine client through its lifecycle.
pub(crate) async fn run(
    session: Arc<Session>,
    client_id: String,
    mut transport: Transport,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
) {
    // Hold new arrivals until the session itself is executing.
    if session.wait_for_execution().await.is_err() {
        transport.close();
        session.remove_client(&client_id);
        return;
    }

    match drive(&session, &client_id, &mut transport, &mut commands).await {
        Ok(()) => info!(session = session.id(), client = %client_id, "client connection closed"),
        Err(err) => {
            warn!(session = session.id(), client = %client_id, error = %err, "client connection failed");
        }
    }
    transport.close();
    session.remove_client(&client_id);
}

async fn drive(
    session: &Arc<Session>,
    client_id: &str,
    transport: &mut Transport,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
) -> Result<(), ProtocolError> {
    let user_id = handshake(session, transport).await?;
    session.set_client_user(client_id, user_id);
    session.set_client_phase(client_id, ClientPhase::Sync);

    sync(session, client_id, transport).await?;

    let drained = session.client_reached_execution(client_id);
    execution(session, client_id, transport, commands, drained).await
}

/// Exchange protocol versions and learn the user behind the client.
///
/// The session initiates: a `handshake` request with a reply deadline.
/// No reply within the deadline is fatal and closes the transport.
async fn handshake(
    session: &Arc<Session>,
    transport: &mut Transport,
) -> Result<Option<String>, ProtocolError> {
    let mut core =
        ProtocolCore::new("client-handshake", transport.sender()).with_middleware(Arc::new(PayloadTrace));
    let config = session.config();

    let (reply_tx, mut reply_rx) = oneshot::channel();
    core.send_request(
        Message::request(
            Payload::new(payloads::HANDSHAKE).with("protocolVersion", config.protocol_version),
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
                    warn!(kind = message.payload.kind(), "unexpected message during handshake");
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
            "protocol version mismatch: peer {:?}, host {}",
            peer_version, config.protocol_version
        )));
    }
    let user_id = reply.payload.str_field("userId").map(String::from);

    core.send(Message::request(Payload::new(payloads::HANDSHAKE_COMPLETE)))?;
    Ok(user_id)
}

/// Replay the session's world into the client, then drain.
async fn sync(
    session: &Arc<Session>,
    client_id: &str,
    transport: &mut Transport,
) -> Result<(), ProtocolError> {
    let mut core =
        ProtocolCore::new("client-sync", transport.sender()).with_middleware(Arc::new(PayloadTrace));

    for message in session.client_begin_sync(client_id) {
        if session.expects_client_reply(message.payload.kind()) {
            let sink = session.sync_reply_sink(client_id, &message);
            core.send_request(message, sink, None)?;
        } else {
            core.send(message)?;
        }
    }
    core.send(Message::request(Payload::new(payloads::SYNC_COMPLETE)))?;

    // Drain: sync is complete once every replay reply is in.
    while core.has_pending() {
        let deadline = core.next_deadline();
        tokio::select! {
            event = transport.recv() => match core.handle_event(event) {
                Incoming::Request(message) => {
                    // Execution traffic arriving early; route it rather
                    // than lose it.
                    session.route_from_client(client_id, message);
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
    }
    Ok(())
}

/// Steady state: transport events up to the session, session commands
/// down to the wire.
async fn execution(
    session: &Arc<Session>,
    client_id: &str,
    transport: &mut Transport,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    drained: Vec<QueuedMessage>,
) -> Result<(), ProtocolError> {
    let mut core =
        ProtocolCore::new("client-execution", transport.sender()).with_middleware(Arc::new(PayloadTrace));

    // Everything queued while the client was joining goes first, in
    // enqueue order.
    for queued in drained {
        match queued.sink {
            Some(sink) => core.send_request(queued.message, sink, queued.timeout)?,
            None => core.send(queued.message)?,
        }
    }

    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            event = transport.recv() => match core.handle_event(event) {
                Incoming::Request(message) => session.route_from_client(client_id, message),
                Incoming::Handled => {}
                Incoming::Closed => return Ok(()),
            },
            command = commands.recv() => match command {
                Some(ClientCommand::Send { message, sink, timeout }) => match sink {
                    Some(sink) => core.send_request(message, sink, timeout)?,
                    None => core.send(message)?,
                },
                Some(ClientCommand::Close) | None => {
                    core.reject_all();
                    return Ok(());
                }
            },
            _ = idle_until(deadline) => {
                if let Some(err) = core.expire() {
                    return Err(err);
                }
            }
        }
    }
}
