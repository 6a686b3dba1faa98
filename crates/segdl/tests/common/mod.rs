//! In-process HTTP server and helpers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use parking_lot::Mutex;
use segdl_engine::{
    DownloadEvent, DownloaderConfig, EngineConfig, RetryPolicy, SessionId, SessionRegistry,
};
use tokio::sync::broadcast;

/// How the test server treats requests for `/file.bin`.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Advertise `Accept-Ranges: bytes` on HEAD.
    pub advertise_ranges: bool,
    /// Answer ranged GETs with 206; otherwise the range is ignored (200).
    pub honour_ranges: bool,
    /// Size of the body pieces the server streams.
    pub chunk_size: usize,
    /// Pause between two body pieces.
    pub chunk_delay: Option<Duration>,
    /// Break the connection of a ranged GET starting at `.0` after `.1` bytes.
    pub fail_at: Option<(u64, usize)>,
    /// How many matching requests are broken; later ones succeed.
    pub fail_times: usize,
    /// Status returned for HEAD (probe) requests.
    pub head_status: StatusCode,
    /// Answer ranged GETs with 206 but serve the same length from offset 0.
    pub misplace_ranges: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            advertise_ranges: true,
            honour_ranges: true,
            chunk_size: 64,
            chunk_delay: None,
            fail_at: None,
            fail_times: usize::MAX,
            head_status: StatusCode::OK,
            misplace_ranges: false,
        }
    }
}

impl ServeOptions {
    pub fn without_ranges() -> Self {
        Self {
            advertise_ranges: false,
            honour_ranges: false,
            ..Self::default()
        }
    }

    pub fn throttled(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_delay = Some(delay);
        self
    }
}

struct ServerState {
    body: Bytes,
    options: ServeOptions,
    failures: AtomicUsize,
    gets: AtomicUsize,
    ranges: Mutex<Vec<String>>,
}

pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start(body: Vec<u8>, options: ServeOptions) -> Self {
        let state = Arc::new(ServerState {
            body: Bytes::from(body),
            options,
            failures: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/file.bin", get(serve_get).head(serve_head))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/file.bin", self.addr)
    }

    pub fn missing_url(&self) -> String {
        format!("http://{}/missing.bin", self.addr)
    }

    /// Number of GET requests served so far.
    pub fn gets(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    /// `Range` header values in arrival order.
    pub fn ranges(&self) -> Vec<String> {
        self.state.ranges.lock().clone()
    }
}

async fn serve_head(State(state): State<Arc<ServerState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, state.body.len().into());
    let accept = if state.options.advertise_ranges { "bytes" } else { "none" };
    headers.insert(header::ACCEPT_RANGES, accept.parse().unwrap());
    (state.options.head_status, headers).into_response()
}

async fn serve_get(State(state): State<Arc<ServerState>>, request: HeaderMap) -> Response {
    state.gets.fetch_add(1, Ordering::SeqCst);
    let total = state.body.len() as u64;

    let range = request
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if let Some(range) = &range {
        state.ranges.lock().push(range.clone());
    }

    let parsed = range
        .as_deref()
        .filter(|_| state.options.honour_ranges)
        .and_then(parse_range);

    let mut headers = HeaderMap::new();
    let (status, start, end) = match parsed {
        Some((start, end)) if start <= end && end < total => {
            let (start, end) = if state.options.misplace_ranges {
                (0, end - start)
            } else {
                (start, end)
            };
            headers.insert(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}").parse().unwrap(),
            );
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        Some(_) => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        None => (StatusCode::OK, 0, total.saturating_sub(1)),
    };

    let slice = if total == 0 {
        Bytes::new()
    } else {
        state.body.slice(start as usize..=end as usize)
    };
    headers.insert(header::CONTENT_LENGTH, slice.len().into());

    let fail_after = match state.options.fail_at {
        Some((at, after))
            if parsed.is_some()
                && at == start
                && state.failures.fetch_add(1, Ordering::SeqCst) < state.options.fail_times =>
        {
            Some(after)
        }
        _ => None,
    };

    let stream = body_stream(slice, state.options.chunk_size, state.options.chunk_delay, fail_after);
    (status, headers, Body::from_stream(stream)).into_response()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn body_stream(
    body: Bytes,
    chunk_size: usize,
    delay: Option<Duration>,
    fail_after: Option<usize>,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send {
    let limit = fail_after.unwrap_or(body.len()).min(body.len());
    futures::stream::unfold(0usize, move |sent| {
        let body = body.clone();
        async move {
            if sent == usize::MAX {
                return None;
            }
            if sent >= limit {
                if fail_after.is_some() {
                    // Give the sent bytes time to reach the client before the reset.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return Some((
                        Err(std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            "injected failure",
                        )),
                        usize::MAX,
                    ));
                }
                return None;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let end = (sent + chunk_size).min(limit);
            Some((Ok(body.slice(sent..end)), end))
        }
    })
}

/// Deterministic body; a misplaced range shows up as different bytes.
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// Engine config for tests; the system proxy would intercept loopback.
pub fn test_config() -> EngineConfig {
    let http = DownloaderConfig {
        use_system_proxy: false,
        ..DownloaderConfig::default()
    };
    EngineConfig::default().with_http(http)
}

pub fn registry(config: EngineConfig) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(config).unwrap())
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
    }
}

/// Collects events of `id` until one matches `stop`, failing after 10s.
pub async fn events_until(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    id: &SessionId,
    stop: impl Fn(&DownloadEvent) -> bool,
) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.session_id() == id => {
                    let done = stop(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for events");
    seen
}

pub async fn until_terminal(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    id: &SessionId,
) -> Vec<DownloadEvent> {
    events_until(rx, id, DownloadEvent::is_terminal).await
}

/// Waits until the session has written at least `bytes`.
pub async fn until_downloaded(
    rx: &mut broadcast::Receiver<DownloadEvent>,
    id: &SessionId,
    bytes: u64,
) {
    events_until(rx, id, |event| {
        matches!(event, DownloadEvent::Progress { progress, .. } if progress.downloaded >= bytes)
    })
    .await;
}
