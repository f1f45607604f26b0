//! Queue-based front-end for yt-dlp and ffmpeg.
//!
//! An [`Orchestrator`] owns two background workers: one resolves URLs into
//! [`VideoRecord`]s, the other downloads a record at a [`QualityTier`],
//! converts it to a [`FileContainer`] when needed and moves it into the
//! destination directory. Both queues are served strictly in order, one
//! request at a time, and every request reports through its own event stream.
//!
//! ```no_run
//! # async fn demo() -> Result<(), yt_dlp_queue::Error> {
//! use yt_dlp_queue::{FileContainer, LifecycleEvent, Orchestrator, QualityTier, Settings};
//!
//! let orchestrator = Orchestrator::start(Settings::default())?;
//! let (records, _ok) = orchestrator
//!     .fetch_metadata_one("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
//!     .collect()
//!     .await;
//! if let Some(record) = records.into_iter().next() {
//!     let mut events = orchestrator.download(record, QualityTier::P720, FileContainer::Mp4);
//!     while let Some(event) = events.next().await {
//!         if let LifecycleEvent::Downloading { percent, .. } = event {
//!             println!("{percent:.1}%");
//!         }
//!     }
//! }
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

pub mod config;
pub mod error;
pub mod files;
pub mod formats;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod progress;

mod download;
mod locks;
mod metadata;

pub use config::Config;
pub use error::{AppError, Error, Result};
pub use formats::{FileContainer, QualityTier};
pub use models::{
    AbortReason, FormatDescriptor, LifecycleEvent, MetadataEvent, Thumbnail, VideoRecord,
};
pub use orchestrator::{DownloadEvents, MetadataEvents, Orchestrator, Settings};

use models::DownloadStatus;

// --- State Type Aliases ---
pub type DownloadState = Arc<Mutex<HashMap<String, DownloadStatus>>>;
pub type ConfigState = Arc<RwLock<Config>>;

/// Shared state of the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub downloads: DownloadState,
    pub config: ConfigState,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        AppState {
            downloads: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(RwLock::new(config)),
            orchestrator,
        }
    }
}
