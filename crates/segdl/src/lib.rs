//! # segdl engine
//!
//! Segmented HTTP download engine. A resource is probed for its size and
//! range support, split into contiguous byte ranges, fetched over several
//! concurrent connections into per-segment sink files, and merged back in
//! range order into the final file.
//!
//! ## Features
//!
//! - Pause/resume that continues every segment from its saved offset
//! - Single-stream fallback for servers without range support
//! - Optional bounded retries with exponential backoff
//! - One broadcast stream of progress and lifecycle events
//!
//! ## Example
//!
//! ```no_run
//! use segdl_engine::{DownloadRequest, EngineConfig, SessionRegistry};
//!
//! # async fn run() -> Result<(), segdl_engine::DownloadError> {
//! let registry = SessionRegistry::new(EngineConfig::default())?;
//! let mut events = registry.subscribe();
//! let id = registry
//!     .add_download(DownloadRequest::new("https://example.com/big.iso", "big.iso").with_connections(8))
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if event.session_id() == &id && event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
mod error;
pub mod events;
pub mod fetcher;
pub mod merge;
pub mod plan;
pub mod probe;
pub mod progress;
pub mod proxy;
pub mod registry;
pub mod request;
pub mod retry;
pub mod session;

pub use client::create_client;
pub use config::{DownloaderConfig, EngineConfig};
pub use error::DownloadError;
pub use events::DownloadEvent;
pub use plan::{Segment, plan_segments};
pub use probe::{HttpProber, ResourceInfo, ResourceProbe};
pub use progress::Progress;
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use registry::SessionRegistry;
pub use request::DownloadRequest;
pub use retry::RetryPolicy;
pub use session::{SessionId, SessionSnapshot, SessionStatus};
