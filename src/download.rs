//! Download worker: yt-dlp into the working directory, optional ffmpeg
//! conversion, then placement under the video title.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::Error;
use crate::files::{self, remove_if_exists};
use crate::formats::{self, FileContainer, QualityTier};
use crate::models::{AbortReason, LifecycleEvent, VideoRecord};
use crate::orchestrator::{Settings, Shared};
use crate::process::{LineControl, OutputLine, PrimaryStream};
use crate::progress;

pub(crate) struct DownloadJob {
    pub(crate) record: VideoRecord,
    pub(crate) tier: QualityTier,
    pub(crate) container: FileContainer,
    pub(crate) events: UnboundedSender<LifecycleEvent>,
}

pub(crate) async fn run_worker(mut queue: UnboundedReceiver<DownloadJob>, shared: Arc<Shared>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        process(&shared, job).await;
    }

    queue.close();
    while let Ok(job) = queue.try_recv() {
        let _ = job.events.send(LifecycleEvent::Aborted { reason: AbortReason::Cancelled });
    }
    tracing::debug!("Download worker stopped");
}

async fn process(shared: &Shared, job: DownloadJob) {
    let DownloadJob { record, tier, container, events } = job;
    let _ = events.send(LifecycleEvent::Starting);
    tracing::info!("Downloading '{}' ({}) at {} as {}", record.title, record.id, tier, container);

    let event = match download(shared, &record, tier, container, &events).await {
        Ok(path) => {
            tracing::info!("Saved '{}' to {}", record.title, path.display());
            LifecycleEvent::Completed { path }
        }
        Err(reason) => {
            tracing::warn!("Download of '{}' aborted: {}", record.title, reason);
            LifecycleEvent::Aborted { reason }
        }
    };
    let _ = events.send(event);
}

/// Runs the whole pipeline for one request. Working files are gone by the
/// time this returns, whatever the outcome.
async fn download(
    shared: &Shared,
    record: &VideoRecord,
    tier: QualityTier,
    container: FileContainer,
    events: &UnboundedSender<LifecycleEvent>,
) -> Result<PathBuf, AbortReason> {
    let settings = shared.settings();

    let mut args: Vec<OsString> = vec![record.url.as_str().into()];
    if tier.is_audio() {
        args.push("-x".into());
    } else {
        if formats::select(&record.formats, tier).video.is_none() {
            tracing::warn!("{} offers no format for {}", record.id, tier);
            return Err(AbortReason::UnresolvedFormat);
        }
        args.push("-f".into());
        args.push(formats::resolve(&record.formats, tier).into());
    }
    args.push("--ffmpeg-location".into());
    args.push(settings.converter.clone().into());

    let base = shared.workdir.new_base_name();
    args.push("-o".into());
    args.push(shared.workdir.path().join(format!("{}.%(ext)s", base)).into());

    let mut tool_error = false;
    let result = shared
        .runner
        .run(&settings.downloader, &args, PrimaryStream::Stdout, |line| {
            let Some(text) = line.text() else {
                return LineControl::Continue;
            };
            if progress::is_download_error(text) {
                tracing::warn!("yt-dlp reported: {}", text);
                tool_error = true;
                return LineControl::Stop;
            }
            if let Some(p) = progress::parse_download_line(text) {
                let _ = events.send(LifecycleEvent::Downloading {
                    percent: p.percent,
                    speed: p.speed,
                    eta: p.eta,
                });
            }
            LineControl::Continue
        })
        .await;

    let failure = match result {
        Ok(_) if tool_error => Some(AbortReason::ToolError),
        Ok(_) => None,
        Err(Error::Cancelled) => Some(AbortReason::Cancelled),
        Err(e) => {
            tracing::error!("yt-dlp could not run: {}", e);
            Some(AbortReason::ToolError)
        }
    };
    if let Some(reason) = failure {
        shared.workdir.remove_partials(&base).await;
        return Err(reason);
    }

    let outputs = shared.workdir.outputs_for(&base);
    let [downloaded] = outputs.as_slice() else {
        tracing::warn!("Expected one output for {}, found {}", base, outputs.len());
        shared.workdir.remove_partials(&base).await;
        return Err(AbortReason::FileResolution);
    };
    let downloaded = downloaded.clone();

    let converted = match conversion_target(&downloaded, container) {
        None => downloaded.clone(),
        Some(target) => {
            let converted = convert(shared, &settings, &downloaded, &target, record, events).await;
            if let Err(reason) = converted {
                remove_if_exists(&downloaded).await;
                remove_if_exists(&target).await;
                return Err(reason);
            }
            target
        }
    };

    let mut stem = files::sanitize_file_name(&record.title);
    if stem.trim().is_empty() {
        stem = files::sanitize_file_name(&record.id);
    }
    let placed = files::place_file(&converted, &settings.destination, &stem).await;

    remove_if_exists(&downloaded).await;
    remove_if_exists(&converted).await;

    placed.map_err(|e| {
        tracing::error!("Could not move {} into {}: {}", converted.display(), settings.destination.display(), e);
        AbortReason::Placement
    })
}

/// Where ffmpeg should write, or `None` when the download can be kept as is.
fn conversion_target(downloaded: &Path, container: FileContainer) -> Option<PathBuf> {
    if container == FileContainer::Original {
        return None;
    }
    let extension = downloaded.extension().map(|e| e.to_string_lossy().to_string());
    if extension.is_some_and(|e| e.eq_ignore_ascii_case(container.extension())) {
        return None;
    }
    Some(downloaded.with_extension(container.extension()))
}

async fn convert(
    shared: &Shared,
    settings: &Settings,
    input: &Path,
    output: &Path,
    record: &VideoRecord,
    events: &UnboundedSender<LifecycleEvent>,
) -> Result<(), AbortReason> {
    let args: Vec<OsString> = vec![
        "-i".into(),
        input.into(),
        output.into(),
        "-stats".into(),
        "-v".into(),
        "warning".into(),
    ];
    let total_secs = record.duration_secs();

    let result = shared
        .runner
        .run(&settings.converter, &args, PrimaryStream::Stderr, |line| {
            let OutputLine::Line(text) = line else {
                return LineControl::Continue;
            };
            // The first line that is not a stats line ends the read loop.
            match progress::parse_conversion_line(text, total_secs) {
                Some(p) => {
                    let _ = events.send(LifecycleEvent::Converting {
                        percent: p.percent,
                        remaining: p.remaining(),
                    });
                    LineControl::Continue
                }
                None => LineControl::Stop,
            }
        })
        .await;

    match result {
        Ok(_) => {
            let _ = events.send(LifecycleEvent::Converting {
                percent: 100.0,
                remaining: Some(progress::format_remaining_time(0)),
            });
            Ok(())
        }
        Err(Error::Cancelled) => Err(AbortReason::Cancelled),
        Err(e) => {
            tracing::error!("ffmpeg could not run: {}", e);
            Err(AbortReason::ConversionError)
        }
    }
}
