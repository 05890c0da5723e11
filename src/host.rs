//! Session host: accepts engine-client transports and owns the table of
//! live sessions.
//!
//! The host reads the session id from the transport's headers (a fresh
//! one is minted when the header is absent), opens the upstream app
//! transport through the [`AppConnector`] seam on first arrival, and
//! reaps the table entry when the session ends.

use crate::config::MuxConfig;
use crate::error::HostError;
use crate::session::Session;
use crate::transport::Transport;
use async_trait::async_trait;
use dashmap::DashMap;
use mremux_proto::SESSION_ID_HEADER;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Opens the upstream app transport for a session.
///
/// How the app is reached — an outbound WebSocket, an in-process
/// channel, a queue — is the embedder's business; the host only needs a
/// connected [`Transport`] back.
#[async_trait]
pub trait AppConnector: Send + Sync {
    /// Connect to the app endpoint serving `session_id`.
    async fn connect(&self, session_id: &str) -> Result<Transport, HostError>;
}

/// Accepts engine-client transports and multiplexes them onto sessions.
pub struct SessionHost {
    connector: Arc<dyn AppConnector>,
    config: MuxConfig,
    // Shared with the per-session reaper tasks.
    sessions: Arc<DashMap<String, Arc<Session>>>,
}

impl SessionHost {
    /// A host that opens app transports through `connector`.
    pub fn new(connector: Arc<dyn AppConnector>, config: MuxConfig) -> Self {
        Self {
            connector,
            config,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// The live session with this id, if any.
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Route an accepted client transport to its session, creating the
    /// session (and its app connection) on first arrival.
    pub async fn accept(&self, transport: Transport) -> Result<Arc<Session>, HostError> {
        let session_id = match transport.headers().get(SESSION_ID_HEADER) {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                debug!(session = %id, "client carried no session header; minted one");
                id
            }
        };

        let session = match self.session(&session_id) {
            Some(session) => session,
            None => self.open_session(session_id).await?,
        };
        session.add_client(transport);
        Ok(session)
    }

    async fn open_session(&self, session_id: String) -> Result<Arc<Session>, HostError> {
        let app = self.connector.connect(&session_id).await?;

        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(session_id.clone()) {
            Entry::Occupied(existing) => {
                // Another arrival raced us here; keep theirs.
                app.close();
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                let session = Session::spawn(session_id.clone(), app, self.config.clone());
                slot.insert(session.clone());
                info!(session = %session_id, "session started");

                let sessions = Arc::clone(&self.sessions);
                let watched = session.clone();
                tokio::spawn(async move {
                    watched.closed().await;
                    sessions.remove(watched.id());
                    info!(session = watched.id(), "session ended");
                });
                Ok(session)
            }
        }
    }
}
