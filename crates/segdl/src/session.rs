//! One download's lifecycle: planning, the fetcher fleet, merge and the
//! pause/resume/cancel state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::DownloadEvent;
use crate::fetcher::{ProgressReporter, SegmentFetcher};
use crate::merge::{merge_segments, remove_temp_dir};
use crate::plan::{Segment, plan_segments};
use crate::probe::ResourceInfo;
use crate::progress::{Progress, ProgressAggregator};
use crate::DownloadError;

/// Opaque session identifier (a v4 UUID), never reused.
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session, as returned by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub url: String,
    pub file_name: String,
    pub target_path: PathBuf,
    /// Total size in bytes, 0 when unknown.
    pub size: u64,
    pub downloaded: u64,
    pub progress: f64,
    pub speed: f64,
    pub status: SessionStatus,
    pub connections: usize,
    pub supports_ranges: bool,
    pub segments: usize,
    pub error: Option<String>,
    pub error_segment: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct SessionState {
    status: SessionStatus,
    segments: Vec<Segment>,
    progress: ProgressAggregator,
    error: Option<String>,
    error_segment: Option<usize>,
    /// Set while the merger owns the sinks; pause is refused meanwhile.
    merging: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

struct RunHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Cancels the run and waits until every fetcher has stopped.
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Run task ended abnormally");
        }
    }
}

pub(crate) struct Session {
    id: SessionId,
    url: Url,
    target: PathBuf,
    temp_dir: PathBuf,
    connections: usize,
    info: ResourceInfo,
    created_at: DateTime<Utc>,
    write_buffer_size: usize,
    fetcher: Arc<SegmentFetcher>,
    events: mpsc::Sender<DownloadEvent>,
    state: Mutex<SessionState>,
    /// Keeps progress events in the order their totals were computed.
    progress_gate: tokio::sync::Mutex<()>,
    /// Serializes control operations; holds the live run, if any.
    control: tokio::sync::Mutex<Option<RunHandle>>,
}

impl Session {
    pub(crate) fn new(
        url: Url,
        target: PathBuf,
        connections: usize,
        info: ResourceInfo,
        fetcher: Arc<SegmentFetcher>,
        config: &EngineConfig,
        events: mpsc::Sender<DownloadEvent>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let temp_dir = temp_dir_for(&target, &id, config);
        Arc::new(Self {
            id,
            url,
            target,
            temp_dir,
            connections,
            info,
            created_at: Utc::now(),
            write_buffer_size: config.write_buffer_size,
            fetcher,
            events,
            state: Mutex::new(SessionState {
                status: SessionStatus::Pending,
                segments: Vec::new(),
                progress: ProgressAggregator::new(info.size),
                error: None,
                error_segment: None,
                merging: false,
                started_at: None,
                finished_at: None,
            }),
            progress_gate: tokio::sync::Mutex::new(()),
            control: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub(crate) fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Plans segments and launches the fetchers. Only acts on a pending session.
    pub(crate) async fn start(self: &Arc<Self>) {
        let mut control = self.control.lock().await;
        {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Pending {
                return;
            }
            state.status = SessionStatus::Downloading;
            state.started_at = Some(Utc::now());
            state.segments = plan_segments(
                self.info.size,
                self.info.supports_ranges,
                self.connections,
                &self.temp_dir,
            );
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.temp_dir).await {
            self.fail(DownloadError::from(e)).await;
            return;
        }

        let segments = self.state.lock().segments.len();
        info!(
            session_id = %self.id,
            url = %self.url,
            size = self.info.size,
            supports_ranges = self.info.supports_ranges,
            segments,
            "Download started"
        );
        self.emit(DownloadEvent::Started {
            session_id: self.id.clone(),
            segments,
        })
        .await;
        self.launch(&mut control);
    }

    /// Stops the fetchers after their current read; offsets are kept.
    pub(crate) async fn pause(self: &Arc<Self>) -> bool {
        let mut control = self.control.lock().await;
        {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Downloading || state.merging {
                return false;
            }
            state.status = SessionStatus::Paused;
        }
        if let Some(run) = control.take() {
            run.stop().await;
        }

        let downloaded = self.state.lock().progress.downloaded();
        info!(session_id = %self.id, downloaded, "Download paused");
        self.emit(DownloadEvent::Paused {
            session_id: self.id.clone(),
        })
        .await;
        true
    }

    /// Relaunches fetchers from the saved offsets. A single-stream session
    /// starts over, since its fetcher cannot continue without ranges.
    pub(crate) async fn resume(self: &Arc<Self>) -> bool {
        let mut control = self.control.lock().await;
        {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Paused {
                return false;
            }
            state.status = SessionStatus::Downloading;
        }

        info!(session_id = %self.id, "Download resumed");
        self.emit(DownloadEvent::Resumed {
            session_id: self.id.clone(),
        })
        .await;
        self.launch(&mut control);
        true
    }

    /// Stops all fetchers, then deletes sinks, temp dir and target file.
    ///
    /// Every known session is cancellable except a completed one, whose
    /// output is final and must not be deleted, and one already cancelled.
    /// Both return false.
    pub(crate) async fn cancel(self: &Arc<Self>) -> bool {
        let mut control = self.control.lock().await;
        if let Some(run) = control.take() {
            run.stop().await;
        }

        {
            let mut state = self.state.lock();
            if matches!(
                state.status,
                SessionStatus::Completed | SessionStatus::Cancelled
            ) {
                return false;
            }
            state.status = SessionStatus::Cancelled;
            state.merging = false;
            state.finished_at = Some(Utc::now());
        }

        remove_temp_dir(&self.temp_dir).await;
        match tokio::fs::remove_file(&self.target).await {
            Ok(()) => debug!(path = %self.target.display(), "Removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.target.display(), error = %e, "Failed to remove output"),
        }

        info!(session_id = %self.id, "Download cancelled");
        self.emit(DownloadEvent::Cancelled {
            session_id: self.id.clone(),
        })
        .await;
        true
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        let Progress {
            downloaded,
            progress,
            speed,
            ..
        } = state.progress.snapshot(Instant::now());
        SessionSnapshot {
            id: self.id.clone(),
            url: self.url.to_string(),
            file_name: self
                .target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            target_path: self.target.clone(),
            size: self.info.size,
            downloaded,
            progress,
            speed,
            status: state.status,
            connections: self.connections,
            supports_ranges: self.info.supports_ranges,
            segments: state.segments.len(),
            error: state.error.clone(),
            error_segment: state.error_segment,
            created_at: self.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    fn launch(self: &Arc<Self>, control: &mut Option<RunHandle>) {
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run(token.clone()));
        *control = Some(RunHandle { token, task });
    }

    #[instrument(skip_all, fields(session_id = %self.id))]
    async fn run(self: Arc<Self>, token: CancellationToken) {
        // Child token: a failing segment stops its siblings without
        // looking like an external pause or cancel.
        let fetch_token = token.child_token();
        let pending: Vec<usize> = {
            let mut state = self.state.lock();
            state.progress.begin_run(Instant::now());
            state
                .segments
                .iter()
                .filter(|s| !s.is_complete())
                .map(|s| s.index)
                .collect()
        };
        debug!(pending = pending.len(), "Launching fetchers");

        let mut fetchers = JoinSet::new();
        for index in pending {
            let session = Arc::clone(&self);
            let fetcher = Arc::clone(&self.fetcher);
            let token = fetch_token.clone();
            fetchers.spawn(async move {
                let result = fetcher.fetch(index, &token, &*session).await;
                (index, result)
            });
        }

        let mut failure: Option<DownloadError> = None;
        while let Some(joined) = fetchers.join_next().await {
            let err = match joined {
                Ok((_, Ok(()))) | Ok((_, Err(DownloadError::Cancelled))) => continue,
                Ok((index, Err(e))) => {
                    debug!(segment = index, error = %e, "Segment failed");
                    e
                }
                Err(e) => DownloadError::internal(format!("segment task failed: {e}")),
            };
            if failure.is_none() {
                fetch_token.cancel();
                failure = Some(err);
            }
        }

        self.state.lock().progress.end_run(Instant::now());
        if token.is_cancelled() {
            trace!("Run stopped by control operation");
            return;
        }

        match failure {
            Some(e) => self.fail(e).await,
            None => self.finish().await,
        }
    }

    async fn finish(&self) {
        let segments = {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Downloading {
                return;
            }
            state.merging = true;
            state.segments.clone()
        };

        match merge_segments(&segments, &self.target, self.write_buffer_size).await {
            Ok(bytes) => {
                remove_temp_dir(&self.temp_dir).await;
                {
                    let mut state = self.state.lock();
                    state.merging = false;
                    state.status = SessionStatus::Completed;
                    state.finished_at = Some(Utc::now());
                }
                info!(
                    session_id = %self.id,
                    path = %self.target.display(),
                    bytes,
                    "Download completed"
                );
                self.emit(DownloadEvent::Completed {
                    session_id: self.id.clone(),
                })
                .await;
            }
            Err(e) => {
                self.state.lock().merging = false;
                self.fail(e).await;
            }
        }
    }

    /// Moves a downloading session to `error`. Partial files stay on disk.
    async fn fail(&self, err: DownloadError) {
        let message = err.to_string();
        let segment = err.segment_index();
        {
            let mut state = self.state.lock();
            if state.status != SessionStatus::Downloading {
                return;
            }
            state.status = SessionStatus::Error;
            state.error = Some(message.clone());
            state.error_segment = segment;
            state.finished_at = Some(Utc::now());
        }

        error!(session_id = %self.id, segment, error = %message, "Download failed");
        self.emit(DownloadEvent::Error {
            session_id: self.id.clone(),
            message,
            segment,
        })
        .await;
    }

    async fn emit(&self, event: DownloadEvent) {
        if self.events.send(event).await.is_err() {
            trace!(session_id = %self.id, "Event channel closed");
        }
    }
}

#[async_trait]
impl ProgressReporter for Session {
    fn segment(&self, index: usize) -> Option<Segment> {
        self.state.lock().segments.get(index).cloned()
    }

    async fn report(&self, index: usize, bytes: u64) {
        let _gate = self.progress_gate.lock().await;
        let progress = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(segment) = state.segments.get_mut(index) else {
                return;
            };
            state.progress.record(segment, bytes, Instant::now())
        };
        self.emit(DownloadEvent::Progress {
            session_id: self.id.clone(),
            progress,
        })
        .await;
    }

    fn rewind(&self, index: usize, offset: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(segment) = state.segments.get_mut(index) {
            state.progress.rewind_segment(segment, offset);
        }
    }
}

/// `<target dir>/<prefix><id><suffix>`, next to the final file.
fn temp_dir_for(target: &Path, id: &str, config: &EngineConfig) -> PathBuf {
    let name = format!("{}{id}{}", config.temp_dir_prefix, config.temp_dir_suffix);
    match target.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
