//! Session registry: the engine's control surface.

use std::sync::Arc;

use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::client::create_client;
use crate::config::EngineConfig;
use crate::events::DownloadEvent;
use crate::fetcher::SegmentFetcher;
use crate::probe::{HttpProber, ResourceProbe};
use crate::request::DownloadRequest;
use crate::session::{Session, SessionId, SessionSnapshot, SessionStatus};
use crate::DownloadError;

/// Keyed collection of download sessions.
///
/// Cheap to share behind an `Arc`; every method is safe to call
/// concurrently. Events of all sessions are fanned into one broadcast
/// channel, see [`SessionRegistry::subscribe`].
pub struct SessionRegistry {
    config: EngineConfig,
    client: Client,
    prober: Arc<dyn ResourceProbe>,
    sessions: DashMap<SessionId, Arc<Session>>,
    event_tx: broadcast::Sender<DownloadEvent>,
}

impl SessionRegistry {
    /// Builds the shared HTTP client and an HTTP prober from `config`.
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let client = create_client(&config.http)?;
        let prober = Arc::new(HttpProber::new(client.clone(), config.http.probe_timeout));
        Ok(Self::with_prober(config, client, prober))
    }

    /// Uses a caller-supplied probe instead of HEAD requests.
    pub fn with_prober(config: EngineConfig, client: Client, prober: Arc<dyn ResourceProbe>) -> Self {
        let (event_tx, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            config,
            client,
            prober,
            sessions: DashMap::new(),
            event_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receiver for the events of every session. Observers that fall more
    /// than `broadcast_capacity` events behind see `Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// Validates, probes, creates and starts a session.
    ///
    /// Invalid requests and probe failures return an error and leave no
    /// session behind.
    pub async fn add_download(&self, request: DownloadRequest) -> Result<SessionId, DownloadError> {
        let url = request.validate()?;

        let requested = request.connections.unwrap_or(self.config.default_connections);
        let connections = match self.config.max_connections {
            Some(max) if requested > max => {
                warn!(requested, max, "Connection count clamped");
                max
            }
            _ => requested,
        };

        let info = self.prober.probe(&url).await?;

        let fetcher = Arc::new(SegmentFetcher::new(
            self.client.clone(),
            url.clone(),
            self.config.retry.clone(),
            self.config.write_buffer_size,
        ));
        let (session_tx, mut session_rx) = mpsc::channel(self.config.event_channel_capacity);
        let session = Session::new(
            url,
            request.target,
            connections,
            info,
            fetcher,
            &self.config,
            session_tx,
        );
        let id = session.id().clone();
        self.sessions.insert(id.clone(), Arc::clone(&session));

        // Relay per-session events to observers; ends once the session is dropped.
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = session_rx.recv().await {
                let _ = event_tx.send(event);
            }
        });

        session.start().await;
        Ok(id)
    }

    /// False unless the session is downloading.
    pub async fn pause(&self, id: &str) -> bool {
        match self.session(id) {
            Some(session) => session.pause().await,
            None => false,
        }
    }

    /// False unless the session is paused.
    pub async fn resume(&self, id: &str) -> bool {
        match self.session(id) {
            Some(session) => session.resume().await,
            None => false,
        }
    }

    /// Stops the session, deletes its files and drops it from the registry.
    ///
    /// False for unknown sessions. A completed session is the one known
    /// session that is refused: its output is final and cancel would delete
    /// it. Failed sessions are accepted and their partial files removed.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some(session) = self.session(id) else {
            return false;
        };
        let cancelled = session.cancel().await;
        if cancelled {
            self.sessions.remove(id);
        }
        cancelled
    }

    /// Forgets a completed or failed session. Files on disk are left alone.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, session| {
                matches!(
                    session.status(),
                    SessionStatus::Completed | SessionStatus::Error
                )
            })
            .is_some();
        if removed {
            debug!(session_id = id, "Session removed");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.session(id).map(|s| s.snapshot())
    }

    /// Snapshots of every session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    /// Cancels every session that has not reached a terminal state.
    /// Returns the ids that were cancelled.
    pub async fn shutdown(&self) -> Vec<SessionId> {
        let live: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut cancelled = Vec::new();
        for session in live {
            if self.cancel(session.id()).await {
                cancelled.push(session.id().clone());
            }
        }

        info!(cancelled = cancelled.len(), "Registry shut down");
        cancelled
    }

    /// Clones the session out so no map guard is held across an await.
    fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }
}
