//! Lifecycle and progress events broadcast to observers.

use serde::Serialize;

use crate::progress::Progress;
use crate::session::SessionId;

/// Notifications emitted by the engine for the surrounding application.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// Segments were planned and fetchers launched.
    Started {
        session_id: SessionId,
        segments: usize,
    },
    Progress {
        session_id: SessionId,
        #[serde(flatten)]
        progress: Progress,
    },
    Paused {
        session_id: SessionId,
    },
    Resumed {
        session_id: SessionId,
    },
    /// The merged file is in place.
    Completed {
        session_id: SessionId,
    },
    Error {
        session_id: SessionId,
        message: String,
        /// Failing segment, `None` for probe and merge failures.
        segment: Option<usize>,
    },
    /// Fetchers stopped and temporaries removed.
    Cancelled {
        session_id: SessionId,
    },
}

impl DownloadEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Started { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::Paused { session_id }
            | Self::Resumed { session_id }
            | Self::Completed { session_id }
            | Self::Error { session_id, .. }
            | Self::Cancelled { session_id } => session_id,
        }
    }

    /// Whether the session reached a terminal state. A failed session can
    /// still be cancelled afterwards, which emits one more `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}
