//! The session: one app endpoint upstream, many engine clients
//! downstream, one merged world between them.
//!
//! A [`Session`] is shared behind an `Arc` by the app-side protocol task
//! and one task per client connection. Every piece of mutable session
//! state — the client table, the sync cache, the authoritative
//! election — lives behind a single mutex, so all session mutations are
//! serialized no matter which connection task performs them. The lock is
//! never held across an await.
//!
//! Routing is rule-driven: messages from the app run through the rules
//! table (which keeps the cache current), then fan out to clients in
//! join order — queued for clients still joining, sent through the
//! command channel of clients in execution. Messages from clients run
//! through their own rule hooks and are forwarded upstream, with reply
//! correlation routed back to the originating client.

pub mod cache;
pub mod client;
pub mod rules;

pub use client::{ClientCommand, ClientInfo, ClientPhase, QueuedMessage};

use crate::config::MuxConfig;
use crate::error::ProtocolError;
use crate::protocol::{self, ReplySink};
use crate::transport::{StatsTracker, Transport, TransportSender};
use cache::SyncCache;
use client::ClientRecord;
use mremux_proto::{payloads, types, Message, Payload};
use rules::{RuleOutcome, Rules};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Lifecycle phase of the app-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    /// Negotiating with the app.
    Handshake,
    /// Caching the app's world.
    Sync,
    /// Steady-state routing.
    Execution,
    /// The session is gone.
    Closed,
}

/// Instruction for the session's app-side task.
#[derive(Debug)]
pub enum AppCommand {
    /// Forward a message upstream; when `reply_to` is set, any reply the
    /// app produces is routed back to that transport.
    Forward {
        /// The envelope to forward.
        message: Message,
        /// Where the app's reply should land.
        reply_to: Option<TransportSender>,
    },
}

#[derive(Default)]
struct SessionState {
    clients: Vec<ClientRecord>,
    cache: SyncCache,
    authoritative: Option<String>,
}

/// One logical session.
pub struct Session {
    // Self-handle for spawning connection tasks and building reply
    // continuations; Weak, so the session's own machinery never keeps
    // it alive.
    me: Weak<Session>,
    id: String,
    config: MuxConfig,
    rules: Rules,
    app_sender: TransportSender,
    app_commands: mpsc::UnboundedSender<AppCommand>,
    state: Mutex<SessionState>,
    phase: watch::Sender<SessionPhase>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

impl Session {
    /// Create the session and start its app-side protocol task.
    pub fn spawn(
        session_id: impl Into<String>,
        app_transport: Transport,
        config: MuxConfig,
    ) -> Arc<Session> {
        let (app_commands, command_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(SessionPhase::Handshake);
        let session = Arc::new_cyclic(|me| Session {
            me: me.clone(),
            id: session_id.into(),
            config,
            rules: Rules::new(),
            app_sender: app_transport.sender(),
            app_commands,
            state: Mutex::new(SessionState::default()),
            phase,
        });
        tokio::spawn(protocol::app::run(
            Arc::clone(&session),
            app_transport,
            command_rx,
        ));
        session
    }

    fn handle(&self) -> Option<Arc<Session>> {
        self.me.upgrade()
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The configuration this session runs with.
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// The app-side phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// The app transport's stats tap: where the authoritative client's
    /// byte counts are mirrored.
    pub fn app_stats(&self) -> Arc<StatsTracker> {
        self.app_sender.stats().clone()
    }

    /// Point-in-time view of every client, ascending join order.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.state().clients.iter().map(ClientRecord::info).collect()
    }

    /// The currently authoritative client, when one is elected.
    pub fn authoritative_client(&self) -> Option<ClientInfo> {
        let state = self.state();
        let id = state.authoritative.clone()?;
        state
            .clients
            .iter()
            .find(|c| c.id == id)
            .map(ClientRecord::info)
    }

    /// Completes once the session has shut down.
    pub async fn closed(&self) {
        let mut phase = self.phase.subscribe();
        while *phase.borrow_and_update() != SessionPhase::Closed {
            if phase.changed().await.is_err() {
                return;
            }
        }
    }

    /// Non-busy wait until the client reaches execution or closes;
    /// returns the phase it settled in.
    pub async fn client_settled(&self, client_id: &str) -> ClientPhase {
        let watch = {
            let state = self.state();
            match state.clients.iter().find(|c| c.id == client_id) {
                Some(client) => client.phase_watch(),
                None => return ClientPhase::Closed,
            }
        };
        let mut watch = watch;
        loop {
            let phase = *watch.borrow_and_update();
            if phase >= ClientPhase::Execution {
                return phase;
            }
            if watch.changed().await.is_err() {
                return ClientPhase::Closed;
            }
        }
    }

    // ------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------

    /// Accept a newly arrived client transport. Returns the client id.
    pub fn add_client(&self, transport: Transport) -> String {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let record = ClientRecord::new(transport.sender(), commands);
        let client_id = record.id.clone();
        {
            let mut state = self.state();
            state.clients.push(record);
            if self.config.peer_authoritative && state.authoritative.is_none() {
                self.elect_locked(&mut state, &client_id);
            }
        }
        info!(session = %self.id, client = %client_id, "client joined");
        match self.handle() {
            Some(session) => {
                tokio::spawn(protocol::client::run(
                    session,
                    client_id.clone(),
                    transport,
                    command_rx,
                ));
            }
            None => transport.close(),
        }
        client_id
    }

    /// Remove a client after its transport closed or a phase failed.
    pub(crate) fn remove_client(&self, client_id: &str) {
        let (record, was_authoritative, now_empty) = {
            let mut state = self.state();
            let Some(position) = state.clients.iter().position(|c| c.id == client_id) else {
                return;
            };
            let record = state.clients.remove(position);
            let was_authoritative = state.authoritative.as_deref() == Some(client_id);
            if was_authoritative {
                state.authoritative = None;
            }
            (record, was_authoritative, state.clients.is_empty())
        };

        record.set_phase(ClientPhase::Closed);
        record.sender.stats().forward_to(None);
        record.sender.close();
        let user_id = record.user_id.clone();
        for queued in record.queued {
            if let Some(sink) = queued.sink {
                sink.complete(Err(ProtocolError::ConnectionClosed));
            }
        }
        info!(session = %self.id, client = %client_id, "client left");

        if was_authoritative {
            self.elect_successor();
        }

        if let Some(user_id) = user_id {
            self.state().cache.remove_user(&user_id);
            // Straight out the app sender: when this was the last client
            // the transport closes right below, and the departure must
            // still get through first.
            let mut notice =
                Message::request(Payload::new(payloads::USER_LEFT).with("userId", user_id));
            notice.ensure_id();
            let _ = self.app_sender.send(notice);
        }

        if now_empty {
            info!(session = %self.id, "last client left; closing session");
            self.disconnect();
        }
    }

    /// Record the user identity a client's handshake produced.
    pub(crate) fn set_client_user(&self, client_id: &str, user_id: Option<String>) {
        let mut state = self.state();
        if let Some(client) = state.clients.iter_mut().find(|c| c.id == client_id) {
            client.user_id = user_id;
        }
    }

    /// Advance a client's phase.
    pub(crate) fn set_client_phase(&self, client_id: &str, phase: ClientPhase) {
        let state = self.state();
        if let Some(client) = state.clients.iter().find(|c| c.id == client_id) {
            client.set_phase(phase);
        }
    }

    /// Take the client's sync snapshot. From this moment, cache-backed
    /// messages queue for the client instead of deferring to the replay.
    pub(crate) fn client_begin_sync(&self, client_id: &str) -> Vec<Message> {
        let mut state = self.state();
        let snapshot = state.cache.replay();
        if let Some(client) = state.clients.iter_mut().find(|c| c.id == client_id) {
            client.snapshot_taken = true;
        }
        snapshot
    }

    /// Mark the client executing and hand back everything queued for it,
    /// in enqueue order. Elects it when no authority exists.
    pub(crate) fn client_reached_execution(&self, client_id: &str) -> Vec<QueuedMessage> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(client) = state.clients.iter_mut().find(|c| c.id == client_id) else {
            return Vec::new();
        };
        client.set_phase(ClientPhase::Execution);
        let drained = client.filter_queued(|_| true);
        if self.config.peer_authoritative && state.authoritative.is_none() {
            self.elect_locked(state, client_id);
        }
        drained
    }

    // ------------------------------------------------------------------
    // Authoritative election
    // ------------------------------------------------------------------

    fn elect_locked(&self, state: &mut SessionState, client_id: &str) {
        if !self.config.peer_authoritative {
            return;
        }
        if !state.clients.iter().any(|c| c.id == client_id) {
            error!(session = %self.id, client = %client_id, "cannot elect nonexistent client");
            return;
        }
        if let Some(old_id) = state.authoritative.take() {
            if let Some(old) = state.clients.iter_mut().find(|c| c.id == old_id) {
                old.authoritative = false;
                old.sender.stats().forward_to(None);
            }
        }
        if let Some(new) = state.clients.iter_mut().find(|c| c.id == client_id) {
            new.authoritative = true;
            new.sender
                .stats()
                .forward_to(Some(self.app_sender.stats().clone()));
            state.authoritative = Some(client_id.to_string());
            info!(session = %self.id, client = %client_id, "client is now authoritative");
        }
    }

    /// After an authority left: the next executing client, ascending
    /// join order. When none has reached execution yet, the next one to
    /// get there is elected on arrival.
    fn elect_successor(&self) {
        let mut state = self.state();
        if !self.config.peer_authoritative || state.authoritative.is_some() {
            return;
        }
        let candidate = state
            .clients
            .iter()
            .find(|c| c.phase() == ClientPhase::Execution)
            .map(|c| c.id.clone());
        if let Some(client_id) = candidate {
            self.elect_locked(&mut state, &client_id);
        }
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Apply rules and cache for one app message; fan it out when the
    /// session is executing.
    pub(crate) fn process_from_app(&self, mut message: Message, fan_out: bool) {
        message.ensure_id();
        let mut guard = self.state();
        let state = &mut *guard;

        let message = match self.rules.from_app(&mut state.cache, message) {
            RuleOutcome::Forward(message) => message,
            RuleOutcome::Drop => return,
        };
        if !fan_out {
            return;
        }

        let expects_reply = self.rules.expects_client_reply(message.payload.kind());
        let exclusive = state.cache.exclusive_user_for(&message).map(String::from);
        let authoritative = state.authoritative.clone();

        for client in state.clients.iter_mut() {
            if let Some(owner) = &exclusive {
                if client.user_id.as_deref() != Some(owner.as_str()) {
                    continue;
                }
            }
            let sink = if expects_reply {
                if authoritative.as_deref() == Some(client.id.as_str()) {
                    Some(self.reply_collector(&message))
                } else {
                    Some(ReplySink::Discard)
                }
            } else {
                None
            };
            deliver(&self.rules, &state.cache, client, message.clone(), sink, None);
        }
    }

    /// Apply rules for one client message and forward it upstream.
    pub(crate) fn route_from_client(&self, client_id: &str, message: Message) {
        let (outcome, reply_to) = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(client) = state.clients.iter().find(|c| c.id == client_id) else {
                debug!(session = %self.id, client = %client_id, "message from removed client dropped");
                return;
            };
            let user = client.user_id.clone();
            let sender = client.sender.clone();
            (
                self.rules.from_client(&mut state.cache, user.as_deref(), message),
                sender,
            )
        };
        if let RuleOutcome::Forward(message) = outcome {
            let _ = self.app_commands.send(AppCommand::Forward {
                message,
                reply_to: Some(reply_to),
            });
        }
    }

    /// Whether fan-out of this payload type expects client replies.
    pub(crate) fn expects_client_reply(&self, kind: &str) -> bool {
        self.rules.expects_client_reply(kind)
    }

    /// Send one envelope to every client, ascending join order. Each
    /// client gets its own clone; clients still joining get it queued.
    pub fn send_to_clients(&self, message: Message) {
        self.send_to_clients_if(message, |_| true);
    }

    /// [`Session::send_to_clients`] restricted by a filter.
    pub fn send_to_clients_if<F>(&self, mut message: Message, filter: F)
    where
        F: Fn(&ClientInfo) -> bool,
    {
        message.ensure_id();
        let mut guard = self.state();
        let state = &mut *guard;
        for client in state.clients.iter_mut() {
            if !filter(&client.info()) {
                continue;
            }
            deliver(&self.rules, &state.cache, client, message.clone(), None, None);
        }
    }

    /// Wrap a payload in a fresh message and send it to every client.
    pub fn send_payload_to_clients(&self, payload: Payload) {
        self.send_to_clients(Message::request(payload));
    }

    /// The sink attached to a replayed creator during a client's sync
    /// phase. The authoritative client's answers complete pending asset
    /// records; everyone else's are absorbed so they never count as
    /// uncorrelated.
    pub(crate) fn sync_reply_sink(&self, client_id: &str, message: &Message) -> ReplySink {
        let authoritative = self.state().authoritative.as_deref() == Some(client_id);
        let session = match self.handle() {
            Some(session) if authoritative && types::creates_assets(message.payload.kind()) => {
                session
            }
            _ => return ReplySink::Discard,
        };
        let creator_id = message.id.clone();
        ReplySink::Callback(Box::new(move |outcome| {
            if let Ok(reply) = outcome {
                session.state().cache.creation_reply(&creator_id, &reply);
            }
        }))
    }

    /// The sink attached to the authoritative client's copy of an app
    /// request: folds asset-creation replies into the cache, then hands
    /// the reply envelope upstream.
    fn reply_collector(&self, request: &Message) -> ReplySink {
        let Some(session) = self.handle() else {
            return ReplySink::Discard;
        };
        let creator_id = request.id.clone();
        let kind = request.payload.kind().to_string();
        ReplySink::Callback(Box::new(move |outcome| match outcome {
            Ok(reply) => {
                if types::creates_assets(&kind) {
                    session.state().cache.creation_reply(&creator_id, &reply);
                }
                if session.app_sender.send(reply).is_err() {
                    debug!(session = %session.id, "app gone; authoritative reply dropped");
                }
            }
            Err(err) => {
                debug!(session = %session.id, error = %err, kind = %kind, "authoritative reply unavailable");
            }
        }))
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Advance the app-side phase. Regressions are ignored.
    pub(crate) fn set_phase(&self, next: SessionPhase) {
        self.phase.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    /// Tear the session down: close the app transport and every client.
    /// Idempotent; also reached when the last client leaves.
    pub fn disconnect(&self) {
        let first = self.phase.send_if_modified(|current| {
            if *current != SessionPhase::Closed {
                *current = SessionPhase::Closed;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }
        info!(session = %self.id, "session closing");
        self.app_sender.close();
        let clients: Vec<_> = self
            .state()
            .clients
            .iter()
            .map(|c| (c.commands.clone(), c.sender.clone()))
            .collect();
        for (commands, sender) in clients {
            let _ = commands.send(ClientCommand::Close);
            sender.close();
        }
    }

    /// Completes when the session reaches execution; fails when it
    /// closes first. New clients hold here before handshaking.
    pub(crate) async fn wait_for_execution(&self) -> Result<(), ProtocolError> {
        let mut phase = self.phase.subscribe();
        loop {
            match *phase.borrow_and_update() {
                SessionPhase::Execution => return Ok(()),
                SessionPhase::Closed => return Err(ProtocolError::ConnectionClosed),
                _ => {}
            }
            if phase.changed().await.is_err() {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Send or queue one envelope for one client.
fn deliver(
    rules: &Rules,
    cache: &SyncCache,
    client: &mut ClientRecord,
    message: Message,
    sink: Option<ReplySink>,
    timeout: Option<Duration>,
) {
    match client.phase() {
        ClientPhase::Execution => {
            if let Err(mpsc::error::SendError(command)) =
                client.commands.send(ClientCommand::Send { message, sink, timeout })
            {
                if let ClientCommand::Send { sink: Some(sink), .. } = command {
                    sink.complete(Err(ProtocolError::ConnectionClosed));
                }
            }
        }
        ClientPhase::Closed => {
            if let Some(sink) = sink {
                sink.complete(Err(ProtocolError::ConnectionClosed));
            }
        }
        ClientPhase::Handshake | ClientPhase::Sync => {
            match rules.queue_for_client(
                cache,
                client.user_id.as_deref(),
                client.snapshot_taken,
                message,
            ) {
                RuleOutcome::Forward(message) => {
                    client.queued.push_back(QueuedMessage { message, sink, timeout });
                }
                RuleOutcome::Drop => {
                    if let Some(sink) = sink {
                        sink.complete(Err(ProtocolError::Dropped));
                    }
                }
            }
        }
    }
}
