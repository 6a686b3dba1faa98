// Segment fetcher: streams one byte range into its private sink file.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{
    Client, StatusCode,
    header::{CONTENT_RANGE, HeaderMap, RANGE},
};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use crate::DownloadError;
use crate::plan::Segment;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Where a fetcher reads its resume offset from and reports written bytes to.
///
/// The session implements this over its locked state; every call is O(1)
/// apart from the clone in [`ProgressReporter::segment`].
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Current view of segment `index`, including its saved offset.
    fn segment(&self, index: usize) -> Option<Segment>;

    /// Records `bytes` appended to the sink of segment `index`.
    async fn report(&self, index: usize, bytes: u64);

    /// Moves the saved offset of segment `index` back to `offset`.
    fn rewind(&self, index: usize, offset: u64);
}

pub struct SegmentFetcher {
    client: Client,
    url: Url,
    retry: RetryPolicy,
    write_buffer_size: usize,
}

impl SegmentFetcher {
    pub fn new(client: Client, url: Url, retry: RetryPolicy, write_buffer_size: usize) -> Self {
        Self {
            client,
            url,
            retry,
            write_buffer_size,
        }
    }

    /// Fetches segment `index` until its range is complete (or, in
    /// single-stream mode, until the server closes the body).
    ///
    /// Stops with [`DownloadError::Cancelled`] once `token` fires; the check
    /// happens between body reads, so at most one more chunk lands after it.
    #[instrument(skip(self, token, reporter), fields(url = %self.url), level = "debug")]
    pub async fn fetch(
        &self,
        index: usize,
        token: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), DownloadError> {
        retry_with_backoff(&self.retry, token, |attempt| {
            if attempt > 0 {
                debug!(segment = index, attempt, "Refetching segment");
            }
            self.fetch_once(index, token, reporter)
        })
        .await
    }

    async fn fetch_once(
        &self,
        index: usize,
        token: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> Result<(), DownloadError> {
        let mut segment = reporter
            .segment(index)
            .ok_or_else(|| DownloadError::internal(format!("unknown segment {index}")))?;

        let sink = if segment.is_ranged() {
            if segment.is_complete() {
                trace!(segment = index, "Segment already complete");
                return Ok(());
            }
            self.open_append(&mut segment, reporter).await?
        } else {
            // No resumable offset without ranges: start over.
            reporter.rewind(index, 0);
            segment.downloaded = 0;
            File::create(&segment.sink).await?
        };
        let mut sink = BufWriter::with_capacity(self.write_buffer_size, sink);

        let mut request = self.client.get(self.url.clone());
        if let Some(range) = segment.range_header() {
            trace!(segment = index, range = %range, "Requesting range");
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response.map_err(|e| {
                let retryable = DownloadError::from(e).is_retryable();
                DownloadError::segment(index, segment.downloaded, "request failed", retryable)
            })?,
        };

        let status = response.status();
        if segment.is_ranged() && status == StatusCode::OK {
            return Err(DownloadError::segment(
                index,
                segment.downloaded,
                "server ignored the Range header",
                false,
            ));
        }
        let expected = if segment.is_ranged() {
            status == StatusCode::PARTIAL_CONTENT
        } else {
            status.is_success()
        };
        if !expected {
            let retryable =
                DownloadError::http_status(status, self.url.as_str(), "segment fetch").is_retryable();
            return Err(DownloadError::segment(
                index,
                segment.downloaded,
                format!("server answered HTTP {status}"),
                retryable,
            ));
        }
        if let Some(end) = segment.end {
            let first = segment.start + segment.downloaded;
            match content_range(response.headers()) {
                Some(served) if served == (first, end) => {}
                served => {
                    let reason = match served {
                        Some((from, to)) => {
                            format!("server sent bytes {from}-{to} for requested {first}-{end}")
                        }
                        None => "partial response without a usable Content-Range".to_owned(),
                    };
                    return Err(DownloadError::segment(index, segment.downloaded, reason, false));
                }
            }
        }

        let mut remaining = segment.remaining();
        let mut body = response.bytes_stream();
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break Err(DownloadError::Cancelled),
                next = body.next() => next,
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let retryable = DownloadError::from(e).is_retryable();
                    break Err(DownloadError::segment(
                        index,
                        segment.downloaded,
                        "stream interrupted",
                        retryable,
                    ));
                }
                None => break Ok(()),
            };

            let take = match remaining {
                Some(left) => (chunk.len() as u64).min(left) as usize,
                None => chunk.len(),
            };
            if let Err(e) = sink.write_all(&chunk[..take]).await {
                break Err(DownloadError::segment(
                    index,
                    segment.downloaded,
                    format!("writing sink failed: {e}"),
                    false,
                ));
            }
            segment.downloaded += take as u64;
            reporter.report(index, take as u64).await;

            if let Some(left) = remaining.as_mut() {
                *left -= take as u64;
                if *left == 0 {
                    if take < chunk.len() {
                        warn!(segment = index, "Server sent bytes past the range end, dropped");
                    }
                    break Ok(());
                }
            }
        };

        if let Err(e) = sink.flush().await {
            warn!(segment = index, error = %e, "Flushing sink failed");
            // Counted bytes may not be on disk; the next attempt re-checks the sink length.
            return Err(DownloadError::segment(
                index,
                segment.downloaded,
                format!("flushing sink failed: {e}"),
                true,
            ));
        }
        outcome?;

        if segment.is_ranged() && !segment.is_complete() {
            return Err(DownloadError::segment(
                index,
                segment.downloaded,
                "stream ended before the range end",
                true,
            ));
        }

        debug!(segment = index, bytes = segment.downloaded, "Segment complete");
        Ok(())
    }

    /// Opens the sink for appending and reconciles the saved offset with the
    /// bytes that actually reached the disk.
    async fn open_append(
        &self,
        segment: &mut Segment,
        reporter: &dyn ProgressReporter,
    ) -> Result<File, DownloadError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment.sink)
            .await?;

        let on_disk = file.metadata().await?.len();
        if on_disk < segment.downloaded {
            warn!(
                segment = segment.index,
                counted = segment.downloaded,
                on_disk,
                "Sink shorter than counted, rewinding"
            );
            reporter.rewind(segment.index, on_disk);
            segment.downloaded = on_disk;
        } else if on_disk > segment.downloaded {
            // Uncounted tail; truncate so the sink matches the offset.
            file.set_len(segment.downloaded).await?;
        }
        Ok(file)
    }
}

/// Parses `Content-Range: bytes <first>-<last>/<total>` into the served range.
fn content_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (range, _total) = range.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan_segments;
    use parking_lot::Mutex;

    /// Reporter over a plain segment list.
    struct VecReporter(Mutex<Vec<Segment>>);

    #[async_trait]
    impl ProgressReporter for VecReporter {
        fn segment(&self, index: usize) -> Option<Segment> {
            self.0.lock().get(index).cloned()
        }

        async fn report(&self, index: usize, bytes: u64) {
            self.0.lock()[index].downloaded += bytes;
        }

        fn rewind(&self, index: usize, offset: u64) {
            let mut segments = self.0.lock();
            let segment = &mut segments[index];
            segment.downloaded = segment.downloaded.min(offset);
        }
    }

    fn fetcher() -> SegmentFetcher {
        SegmentFetcher::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/never").unwrap(),
            RetryPolicy::none(),
            1024,
        )
    }

    #[tokio::test]
    async fn complete_segment_needs_no_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = plan_segments(100, true, 2, dir.path());
        segments[1].downloaded = 50;
        let reporter = VecReporter(Mutex::new(segments));

        // The URL is unreachable, so success proves no request was made.
        let token = CancellationToken::new();
        assert!(fetcher().fetch(1, &token, &reporter).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_before_start_does_not_touch_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = plan_segments(100, true, 2, dir.path());
        segments[0].downloaded = 10;
        std::fs::write(&segments[0].sink, [7u8; 10]).unwrap();
        let reporter = VecReporter(Mutex::new(segments));

        let token = CancellationToken::new();
        token.cancel();
        let result = fetcher().fetch(0, &token, &reporter).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert_eq!(reporter.segment(0).unwrap().downloaded, 10);
    }

    #[tokio::test]
    async fn short_sink_rewinds_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = plan_segments(100, true, 1, dir.path());
        segments[0].downloaded = 40;
        std::fs::write(&segments[0].sink, [1u8; 25]).unwrap();
        let reporter = VecReporter(Mutex::new(segments));

        let mut segment = reporter.segment(0).unwrap();
        fetcher().open_append(&mut segment, &reporter).await.unwrap();
        assert_eq!(segment.downloaded, 25);
        assert_eq!(reporter.segment(0).unwrap().downloaded, 25);
    }

    #[tokio::test]
    async fn long_sink_is_truncated_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments = plan_segments(100, true, 1, dir.path());
        segments[0].downloaded = 10;
        std::fs::write(&segments[0].sink, [1u8; 30]).unwrap();
        let reporter = VecReporter(Mutex::new(segments));

        let mut segment = reporter.segment(0).unwrap();
        fetcher().open_append(&mut segment, &reporter).await.unwrap();
        assert_eq!(std::fs::metadata(&segment.sink).unwrap().len(), 10);
        assert_eq!(segment.downloaded, 10);
    }

    #[test]
    fn parses_content_range() {
        let headers = |value: &str| {
            let mut map = HeaderMap::new();
            map.insert(CONTENT_RANGE, value.parse().unwrap());
            map
        };
        assert_eq!(content_range(&headers("bytes 250-499/1000")), Some((250, 499)));
        assert_eq!(content_range(&headers("bytes 0-9/*")), Some((0, 9)));
        assert_eq!(content_range(&headers("bytes */1000")), None);
        assert_eq!(content_range(&headers("items 0-9/10")), None);
        assert_eq!(content_range(&HeaderMap::new()), None);
    }
}
