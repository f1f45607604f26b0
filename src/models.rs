use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::formats::{self, FileContainer, QualityTier};

// === yt-dlp Metadata Models ===

/// One video as described by a single `yt-dlp -j` output line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VideoRecord {
    #[serde(default)]
    pub title: String,
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(rename = "webpage_url", default)]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub formats: Vec<FormatDescriptor>,
    #[serde(default)]
    pub is_live: Option<bool>,
    /// Length in seconds; absent for live streams.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(rename = "playlist_id", default)]
    pub playlist: Option<String>,

    /// Filled in by [`VideoRecord::parse`], never read from the wire.
    #[serde(skip_deserializing, default)]
    pub available_tiers: BTreeSet<QualityTier>,
}

/// A single format available for download.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FormatDescriptor {
    pub format_id: String,
    /// `None` for audio-only formats.
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub ext: String,
    #[serde(rename = "format_note", default)]
    pub note: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl VideoRecord {
    /// Deserializes one metadata line and computes the tiers it offers.
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        let mut record: VideoRecord = serde_json::from_str(line)?;
        record.available_tiers = formats::available_tiers(&record.formats);
        Ok(record)
    }

    pub fn is_live(&self) -> bool {
        self.is_live == Some(true)
    }

    pub fn is_tier_available(&self, tier: QualityTier) -> bool {
        self.available_tiers.contains(&tier)
    }

    /// Seconds of media, `0.0` when the source did not report a duration.
    pub fn duration_secs(&self) -> f64 {
        self.duration.unwrap_or(0.0)
    }
}

impl FormatDescriptor {
    /// The format note, falling back to the height rendered as text.
    pub fn note_or_height(&self) -> Option<String> {
        match (&self.note, self.height) {
            (Some(note), _) => Some(note.clone()),
            (None, Some(height)) => Some(height.to_string()),
            (None, None) => None,
        }
    }
}

impl fmt::Display for VideoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers: Vec<&str> = self.available_tiers.iter().map(|t| t.label()).collect();
        write!(
            f,
            "[id: {}, title: {}, duration: {}s, tiers: {}, thumbnails: {}]",
            self.id,
            self.title,
            self.duration_secs(),
            tiers.join(","),
            self.thumbnails.len()
        )
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// === Pipeline Events ===

/// Why a download request was abandoned.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Unknown tier, or the record offers no format for the tier.
    UnresolvedFormat,
    /// The download tool printed an `ERROR` line or could not be started.
    ToolError,
    /// The download produced no file, or more than one.
    FileResolution,
    /// The conversion tool could not be started.
    ConversionError,
    /// Moving the result into the destination directory failed.
    Placement,
    /// The orchestrator shut down before the request finished.
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::UnresolvedFormat => "unresolved format",
            AbortReason::ToolError | AbortReason::FileResolution => "downloading error",
            AbortReason::ConversionError => "converting error",
            AbortReason::Placement => "move error",
            AbortReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Progress of one download request, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Queued,
    Starting,
    Downloading {
        percent: f64,
        speed: String,
        eta: Option<String>,
    },
    Converting {
        percent: f64,
        /// `None` while the converter reports no usable speed.
        remaining: Option<String>,
    },
    Completed {
        path: PathBuf,
    },
    Aborted {
        reason: AbortReason,
    },
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleEvent::Completed { .. } | LifecycleEvent::Aborted { .. })
    }
}

/// Output of one metadata request: records, then exactly one `Finished`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEvent {
    Record(VideoRecord),
    Finished { success: bool },
}

// === API Request/Response Models ===

/// The query parameters for a `GET /info` request.
#[derive(Deserialize, Debug)]
pub struct InfoRequest {
    pub url: String,
}

/// The JSON body for a `POST /download` request.
#[derive(Deserialize, Debug)]
pub struct DownloadRequest {
    pub url: String,
    /// Tier label, e.g. "720" or "audio".
    pub quality: String,
    #[serde(default)]
    pub container: FileContainer,
}

/// The response sent after a download was queued.
#[derive(Serialize, Debug)]
pub struct DownloadResponse {
    pub message: String,
    pub download_key: String,
}

/// Latest known state of a single download, as served by `GET /status`.
#[derive(Clone, Serialize, Debug, Default)]
pub struct DownloadStatus {
    pub title: String,
    pub status: String, // "queued", "starting", "downloading", "converting", "completed", "failed"
    pub progress: f64,
    pub eta: String,
    pub speed: String,
    pub file: Option<String>,
    pub error: Option<String>,
}

impl DownloadStatus {
    pub fn queued(title: &str) -> Self {
        DownloadStatus {
            title: title.to_string(),
            status: "queued".to_string(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Queued => self.status = "queued".to_string(),
            LifecycleEvent::Starting => self.status = "starting".to_string(),
            LifecycleEvent::Downloading { percent, speed, eta } => {
                self.status = "downloading".to_string();
                self.progress = *percent;
                self.speed = speed.clone();
                self.eta = eta.clone().unwrap_or_default();
            }
            LifecycleEvent::Converting { percent, remaining } => {
                self.status = "converting".to_string();
                self.progress = *percent;
                self.speed.clear();
                self.eta = remaining.clone().unwrap_or_default();
            }
            LifecycleEvent::Completed { path } => {
                self.status = "completed".to_string();
                self.progress = 100.0;
                self.eta.clear();
                self.file = Some(path.to_string_lossy().to_string());
            }
            LifecycleEvent::Aborted { reason } => {
                self.status = "failed".to_string();
                self.error = Some(reason.to_string());
            }
        }
    }
}
