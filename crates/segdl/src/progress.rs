//! Session progress: per-segment counters rolled up into totals, percentage and speed.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::plan::Segment;

/// Session-level progress, as reported to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Progress {
    /// Bytes written across all segments.
    pub downloaded: u64,
    /// Total size in bytes; 0 when unknown.
    pub total: u64,
    /// Percentage in `[0, 100]`; 0 while the size is unknown.
    pub progress: f64,
    /// Average throughput in bytes per second over the active download time.
    pub speed: f64,
}

/// Folds segment byte counts into session totals.
///
/// Every update goes through [`ProgressAggregator::record`], which bumps the
/// segment and the session counters together, so the session total equals the
/// sum over segments whenever the owning lock is released. Speed is the
/// cumulative average over time spent downloading; paused time is excluded.
#[derive(Debug)]
pub struct ProgressAggregator {
    total: u64,
    downloaded: u64,
    active: Duration,
    run_started: Option<Instant>,
}

impl ProgressAggregator {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            downloaded: 0,
            active: Duration::ZERO,
            run_started: None,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Marks the start of a run (initial start or resume).
    pub fn begin_run(&mut self, now: Instant) {
        if self.run_started.is_none() {
            self.run_started = Some(now);
        }
    }

    /// Marks the end of a run (pause, completion, failure).
    pub fn end_run(&mut self, now: Instant) {
        if let Some(started) = self.run_started.take() {
            self.active += now.saturating_duration_since(started);
        }
    }

    /// Adds `bytes` freshly written by `segment`'s fetcher.
    pub fn record(&mut self, segment: &mut Segment, bytes: u64, now: Instant) -> Progress {
        segment.downloaded += bytes;
        self.downloaded += bytes;
        self.snapshot(now)
    }

    /// Moves `segment` back to `offset` bytes. Used when a single-stream
    /// transfer restarts from zero, or when a sink holds fewer bytes than
    /// were counted.
    pub fn rewind_segment(&mut self, segment: &mut Segment, offset: u64) {
        let offset = offset.min(segment.downloaded);
        self.downloaded -= segment.downloaded - offset;
        segment.downloaded = offset;
        if self.downloaded == 0 {
            self.active = Duration::ZERO;
        }
    }

    pub fn snapshot(&self, now: Instant) -> Progress {
        let progress = if self.total > 0 {
            (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let elapsed = self.active
            + self
                .run_started
                .map(|started| now.saturating_duration_since(started))
                .unwrap_or_default();
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            self.downloaded as f64 / secs
        } else {
            0.0
        };

        Progress {
            downloaded: self.downloaded,
            total: self.total,
            progress,
            speed,
        }
    }
}
