use indicatif::{HumanBytes, ProgressStyle};
use segdl_engine::{DownloadEvent, SessionSnapshot};
use tracing::{Span, error, info, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// How download events reach the user.
pub enum Output {
    /// Progress bar attached to a tracing span.
    Bar { span: Span },
    /// One JSON object per event on stdout.
    Json,
    /// Log lines only (non-interactive terminals).
    Plain,
}

impl Output {
    pub fn bar(snapshot: &SessionSnapshot) -> Self {
        let span = info_span!("download", indicatif.pb_show = true, file = %snapshot.file_name);
        span.pb_set_style(&bar_style(snapshot.size));
        if snapshot.size > 0 {
            span.pb_set_length(snapshot.size);
        }
        span.pb_set_message("starting");
        Self::Bar { span }
    }

    /// Span the event loop runs in; the bar is drawn while it is entered.
    pub fn span(&self) -> Span {
        match self {
            Self::Bar { span } => span.clone(),
            Self::Json | Self::Plain => Span::none(),
        }
    }

    pub fn event(&self, event: &DownloadEvent) {
        match self {
            Self::Bar { span } => render_bar(span, event),
            Self::Json => match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => error!(error = %e, "Failed to serialize event"),
            },
            // The engine's own log lines describe the lifecycle.
            Self::Plain => {}
        }
    }

    pub fn finish(&self, snapshot: Option<&SessionSnapshot>) {
        let Some(snapshot) = snapshot else {
            return;
        };
        match self {
            Self::Json => {
                if let Ok(line) = serde_json::to_string(snapshot) {
                    println!("{line}");
                }
            }
            Self::Bar { .. } | Self::Plain => {
                info!(
                    status = %snapshot.status,
                    path = %snapshot.target_path.display(),
                    size = %HumanBytes(snapshot.downloaded),
                    "Finished"
                );
            }
        }
    }
}

fn bar_style(size: u64) -> ProgressStyle {
    let template = if size > 0 {
        "{span_child_prefix}{spinner:.green} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}"
    } else {
        "{span_child_prefix}{spinner:.green} {bytes} {msg}"
    };
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn render_bar(span: &Span, event: &DownloadEvent) {
    match event {
        DownloadEvent::Started { segments, .. } => {
            span.pb_set_message(&format!("{segments} segment(s)"));
        }
        DownloadEvent::Progress { progress, .. } => {
            span.pb_set_position(progress.downloaded);
            span.pb_set_message(&format!("{}/s", HumanBytes(progress.speed as u64)));
        }
        DownloadEvent::Paused { .. } => span.pb_set_message("paused (p to resume)"),
        DownloadEvent::Resumed { .. } => span.pb_set_message("resuming"),
        DownloadEvent::Completed { .. } => span.pb_set_message("done"),
        DownloadEvent::Error { .. } => span.pb_set_message("failed"),
        DownloadEvent::Cancelled { .. } => span.pb_set_message("cancelled"),
    }
}
