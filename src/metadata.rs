//! Metadata worker: runs `yt-dlp -j` for each queued URL.

use std::ffi::OsString;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::Error;
use crate::models::{MetadataEvent, VideoRecord};
use crate::orchestrator::Shared;
use crate::process::{LineControl, PrimaryStream};
use crate::progress;

/// Shortest line that can be a JSON record; anything shorter is chatter.
const MIN_RECORD_LEN: usize = 10;

pub(crate) struct MetadataJob {
    pub(crate) urls: Vec<String>,
    pub(crate) events: UnboundedSender<MetadataEvent>,
}

pub(crate) async fn run_worker(mut queue: UnboundedReceiver<MetadataJob>, shared: Arc<Shared>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        fetch(&shared, job).await;
    }

    queue.close();
    while let Ok(job) = queue.try_recv() {
        let _ = job.events.send(MetadataEvent::Finished { success: false });
    }
    tracing::debug!("Metadata worker stopped");
}

async fn fetch(shared: &Shared, job: MetadataJob) {
    let settings = shared.settings();
    let mut success = true;

    for url in &job.urls {
        tracing::info!("Fetching metadata for {}", url);
        let args: Vec<OsString> = vec![
            "-iqsj".into(),
            url.into(),
            "--socket-timeout".into(),
            settings.socket_timeout_secs.to_string().into(),
        ];

        let mut failed = false;
        let result = shared
            .runner
            .run(&settings.downloader, &args, PrimaryStream::Stdout, |line| {
                let Some(text) = line.text() else {
                    return LineControl::Continue;
                };
                if progress::is_metadata_error(text) {
                    tracing::warn!("yt-dlp failed for {}: {}", url, text);
                    failed = true;
                    return LineControl::Stop;
                }
                // Anything long enough that is not a warning is taken to be a
                // JSON record; there is no further shape check.
                if text.chars().count() > MIN_RECORD_LEN && !text.contains("WARNING") {
                    match VideoRecord::parse(text) {
                        Ok(record) if record.is_live() => {
                            tracing::debug!("Skipping live stream {}", record.id);
                        }
                        Ok(record) => {
                            tracing::info!("Got metadata for '{}' ({})", record.title, record.id);
                            let _ = job.events.send(MetadataEvent::Record(record));
                        }
                        Err(e) => tracing::debug!("Discarding non-record line: {}", e),
                    }
                }
                LineControl::Continue
            })
            .await;

        match result {
            Ok(_) => {}
            Err(Error::Cancelled) => {
                success = false;
                break;
            }
            Err(e) => {
                tracing::error!("Metadata lookup for {} failed: {}", url, e);
                failed = true;
            }
        }
        if failed {
            success = false;
        }
    }

    let _ = job.events.send(MetadataEvent::Finished { success });
}
