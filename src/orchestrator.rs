//! The queue front-end: owns both workers and everything they share.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc::{self, error::SendError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::download::{self, DownloadJob};
use crate::error::{Error, Result};
use crate::files::WorkDir;
use crate::formats::{FileContainer, QualityTier};
use crate::locks::{resilient_lock, resilient_read, resilient_write};
use crate::metadata::{self, MetadataJob};
use crate::models::{AbortReason, LifecycleEvent, MetadataEvent, VideoRecord};
use crate::process::{ProcessRegistry, ProcessRunner};

pub const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 10;

/// Tool locations and output options used by the workers.
///
/// Each request takes a snapshot when it starts, so changes apply to the
/// next request rather than the one in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// yt-dlp executable; a bare name is looked up on `PATH`.
    pub downloader: PathBuf,
    /// ffmpeg executable; a bare name is looked up on `PATH`.
    pub converter: PathBuf,
    pub destination: PathBuf,
    pub socket_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            downloader: PathBuf::from("yt-dlp"),
            converter: PathBuf::from("ffmpeg"),
            destination: config::default_download_dir(),
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
        }
    }
}

/// Checks that a tool path names an existing file and makes it absolute.
pub fn validate_tool_path(path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(Error::PathNotFound(path.to_path_buf()));
    }
    std::fs::canonicalize(path).map_err(|_| Error::PathNotFound(path.to_path_buf()))
}

/// State shared by the two workers.
pub(crate) struct Shared {
    pub(crate) runner: ProcessRunner,
    pub(crate) workdir: WorkDir,
    pub(crate) shutdown: CancellationToken,
    settings: RwLock<Settings>,
}

impl Shared {
    pub(crate) fn settings(&self) -> Settings {
        resilient_read(&self.settings).clone()
    }
}

/// Queues metadata lookups and downloads onto two background workers.
///
/// Each queue is served strictly in order, one request at a time. Every
/// request gets its own event stream, which closes after its last event.
///
/// Must be created inside a tokio runtime. Call [`Orchestrator::shutdown`]
/// to kill running tools and remove the working directory.
pub struct Orchestrator {
    shared: Arc<Shared>,
    metadata_tx: UnboundedSender<MetadataJob>,
    download_tx: UnboundedSender<DownloadJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn start(settings: Settings) -> Result<Self> {
        let shared = Arc::new(Shared {
            runner: ProcessRunner::new(Arc::new(ProcessRegistry::new())),
            workdir: WorkDir::create()?,
            shutdown: CancellationToken::new(),
            settings: RwLock::new(settings),
        });

        let (metadata_tx, metadata_rx) = mpsc::unbounded_channel();
        let (download_tx, download_rx) = mpsc::unbounded_channel();

        let workers = vec![
            tokio::spawn(metadata::run_worker(metadata_rx, Arc::clone(&shared))),
            tokio::spawn(download::run_worker(download_rx, Arc::clone(&shared))),
        ];
        tracing::info!("Orchestrator started");

        Ok(Self {
            shared,
            metadata_tx,
            download_tx,
            workers: Mutex::new(workers),
        })
    }

    /// Queues a metadata lookup for `urls`, processed in the given order.
    pub fn fetch_metadata<I, S>(&self, urls: I) -> MetadataEvents
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (events, rx) = mpsc::unbounded_channel();
        let job = MetadataJob {
            urls: urls.into_iter().map(Into::into).collect(),
            events,
        };
        tracing::debug!("Queued metadata request for {:?}", job.urls);
        if let Err(SendError(job)) = self.metadata_tx.send(job) {
            let _ = job.events.send(MetadataEvent::Finished { success: false });
        }
        MetadataEvents { rx }
    }

    pub fn fetch_metadata_one(&self, url: impl Into<String>) -> MetadataEvents {
        self.fetch_metadata([url.into()])
    }

    /// Queues a download of `record` at `tier`, converted to `container`.
    ///
    /// An `Unknown` tier is refused on the spot with a single `Aborted`.
    pub fn download(
        &self,
        record: VideoRecord,
        tier: QualityTier,
        container: FileContainer,
    ) -> DownloadEvents {
        let (events, rx) = mpsc::unbounded_channel();

        if tier == QualityTier::Unknown {
            tracing::warn!("Refusing to download {}: unknown quality", record.id);
            let _ = events.send(LifecycleEvent::Aborted { reason: AbortReason::UnresolvedFormat });
            return DownloadEvents { rx };
        }

        let _ = events.send(LifecycleEvent::Queued);
        tracing::debug!("Queued download of {} at {} as {}", record.id, tier, container);
        let job = DownloadJob { record, tier, container, events };
        if let Err(SendError(job)) = self.download_tx.send(job) {
            let _ = job.events.send(LifecycleEvent::Aborted { reason: AbortReason::Cancelled });
        }
        DownloadEvents { rx }
    }

    pub fn settings(&self) -> Settings {
        self.shared.settings()
    }

    pub fn set_downloader_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = validate_tool_path(path.as_ref())?;
        resilient_write(&self.shared.settings).downloader = path;
        Ok(())
    }

    pub fn set_converter_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = validate_tool_path(path.as_ref())?;
        resilient_write(&self.shared.settings).converter = path;
        Ok(())
    }

    pub fn set_destination_dir(&self, dir: impl Into<PathBuf>) {
        resilient_write(&self.shared.settings).destination = dir.into();
    }

    pub fn set_socket_timeout(&self, secs: u64) {
        resilient_write(&self.shared.settings).socket_timeout_secs = secs;
    }

    /// Swaps in settings that were already validated, e.g. by
    /// [`crate::config::Config::to_settings`].
    pub fn replace_settings(&self, settings: Settings) {
        *resilient_write(&self.shared.settings) = settings;
    }

    pub fn working_dir(&self) -> &Path {
        self.shared.workdir.path()
    }

    /// Number of tool processes running right now.
    pub fn running_processes(&self) -> usize {
        self.shared.runner.registry().len()
    }

    /// Kills every running tool, waits for both workers to stop, aborts the
    /// requests still queued and removes the working directory.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let killed = self.shared.runner.registry().kill_all();
        tracing::info!("Shutting down, killing {} running process(es)", killed);

        let workers = std::mem::take(&mut *resilient_lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker ended abnormally: {}", e);
            }
        }

        self.shared.workdir.close();
        tracing::info!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Without an explicit shutdown, at least stop the tools; the working
        // directory goes when the workers release `Shared`.
        self.shared.shutdown.cancel();
        self.shared.runner.registry().kill_all();
    }
}

/// Event stream of one download request.
#[derive(Debug)]
pub struct DownloadEvents {
    rx: UnboundedReceiver<LifecycleEvent>,
}

impl DownloadEvents {
    /// The next event, or `None` once the request is over.
    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    /// Waits for the request to finish and returns every event.
    pub async fn collect(mut self) -> Vec<LifecycleEvent> {
        let mut all = Vec::new();
        while let Some(event) = self.rx.recv().await {
            all.push(event);
        }
        all
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<LifecycleEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Event stream of one metadata request.
#[derive(Debug)]
pub struct MetadataEvents {
    rx: UnboundedReceiver<MetadataEvent>,
}

impl MetadataEvents {
    pub async fn next(&mut self) -> Option<MetadataEvent> {
        self.rx.recv().await
    }

    /// Waits for the request to finish; returns the records and whether
    /// every URL succeeded.
    pub async fn collect(mut self) -> (Vec<VideoRecord>, bool) {
        let mut records = Vec::new();
        let mut success = false;
        while let Some(event) = self.rx.recv().await {
            match event {
                MetadataEvent::Record(record) => records.push(record),
                MetadataEvent::Finished { success: ok } => success = ok,
            }
        }
        (records, success)
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<MetadataEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_path_is_rejected() {
        let err = validate_tool_path(Path::new("/no/such/yt-dlp")).unwrap_err();
        assert!(matches!(err, Error::PathNotFound(p) if p == Path::new("/no/such/yt-dlp")));
    }

    #[test]
    fn directory_is_not_a_tool() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(validate_tool_path(dir.path()), Err(Error::PathNotFound(_))));
    }

    #[tokio::test]
    async fn setters_validate_and_update_settings() {
        let orchestrator = Orchestrator::start(Settings::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("yt-dlp");
        std::fs::write(&tool, b"").unwrap();

        orchestrator.set_downloader_path(&tool).unwrap();
        assert!(orchestrator.set_converter_path(dir.path().join("ffmpeg")).is_err());
        orchestrator.set_destination_dir(dir.path());
        orchestrator.set_socket_timeout(3);

        let settings = orchestrator.settings();
        assert_eq!(settings.downloader, std::fs::canonicalize(&tool).unwrap());
        assert_eq!(settings.converter, PathBuf::from("ffmpeg"));
        assert_eq!(settings.destination, dir.path());
        assert_eq!(settings.socket_timeout_secs, 3);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn requests_after_shutdown_end_immediately() {
        let orchestrator = Orchestrator::start(Settings::default()).unwrap();
        let workdir = orchestrator.working_dir().to_path_buf();
        orchestrator.shutdown().await;
        assert!(!workdir.exists());

        let (records, success) = orchestrator.fetch_metadata_one("https://example.com/v").collect().await;
        assert!(records.is_empty());
        assert!(!success);
    }
}
