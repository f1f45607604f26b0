//! Quality tiers, output containers and the mapping from a tier to a yt-dlp
//! format selector.
//!
//! Matching is deliberately loose: a descriptor matches a tier when its
//! height equals the tier or its note merely contains the tier's number, and
//! the first match in source order wins.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::models::FormatDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QualityTier {
    /// Parse-failure sentinel; never available and never downloadable.
    #[default]
    Unknown,
    AudioOnly,
    P144,
    P240,
    P360,
    P480,
    P720,
    P1080,
}

impl QualityTier {
    pub const ALL: [QualityTier; 7] = [
        QualityTier::AudioOnly,
        QualityTier::P144,
        QualityTier::P240,
        QualityTier::P360,
        QualityTier::P480,
        QualityTier::P720,
        QualityTier::P1080,
    ];

    pub fn label(self) -> &'static str {
        match self {
            QualityTier::Unknown => "unknown",
            QualityTier::AudioOnly => "audio",
            QualityTier::P144 => "144",
            QualityTier::P240 => "240",
            QualityTier::P360 => "360",
            QualityTier::P480 => "480",
            QualityTier::P720 => "720",
            QualityTier::P1080 => "1080",
        }
    }

    /// Inverse of [`QualityTier::label`]; anything unrecognised is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|tier| tier.label() == label)
            .unwrap_or(QualityTier::Unknown)
    }

    /// Pixel height of a video tier.
    pub fn height(self) -> Option<u32> {
        match self {
            QualityTier::Unknown | QualityTier::AudioOnly => None,
            QualityTier::P144 => Some(144),
            QualityTier::P240 => Some(240),
            QualityTier::P360 => Some(360),
            QualityTier::P480 => Some(480),
            QualityTier::P720 => Some(720),
            QualityTier::P1080 => Some(1080),
        }
    }

    pub fn is_audio(self) -> bool {
        self == QualityTier::AudioOnly
    }

    pub fn is_video(self) -> bool {
        self.height().is_some()
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for QualityTier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(QualityTier::from_label(s.trim_end_matches('p')))
    }
}

impl Serialize for QualityTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for QualityTier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(QualityTier::from_label(&label))
    }
}

/// Output container requested for a download.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileContainer {
    Mp3,
    Wav,
    /// Keep whatever yt-dlp produced.
    #[default]
    Original,
    Mkv,
    Mp4,
}

impl FileContainer {
    pub const ALL: [FileContainer; 5] = [
        FileContainer::Mp3,
        FileContainer::Wav,
        FileContainer::Original,
        FileContainer::Mkv,
        FileContainer::Mp4,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            FileContainer::Mp3 => "mp3",
            FileContainer::Wav => "wav",
            FileContainer::Original => "original",
            FileContainer::Mkv => "mkv",
            FileContainer::Mp4 => "mp4",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, FileContainer::Mp3 | FileContainer::Wav)
    }

    pub fn is_video(self) -> bool {
        !self.is_audio()
    }

    pub fn audio() -> impl Iterator<Item = FileContainer> {
        Self::ALL.into_iter().filter(|c| c.is_audio())
    }

    pub fn video() -> impl Iterator<Item = FileContainer> {
        Self::ALL.into_iter().filter(|c| c.is_video())
    }
}

impl fmt::Display for FileContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for FileContainer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.extension() == wanted)
            .ok_or_else(|| format!("unsupported container '{}'", s))
    }
}

/// Tiers offered by a set of formats.
///
/// Audio is offered as soon as there is any format at all. A video tier is
/// offered when a height, or a note with its unit character dropped ("720p"),
/// spells out the tier's number.
pub fn available_tiers(formats: &[FormatDescriptor]) -> BTreeSet<QualityTier> {
    let mut tiers = BTreeSet::new();
    if !formats.is_empty() {
        tiers.insert(QualityTier::AudioOnly);
    }

    for format in formats {
        if let Some(height) = format.height {
            push_known(&mut tiers, QualityTier::from_label(&height.to_string()));
        }
        if let Some(note) = format.note_or_height() {
            let mut chars = note.chars();
            chars.next_back();
            push_known(&mut tiers, QualityTier::from_label(chars.as_str()));
        }
    }

    tiers
}

fn push_known(tiers: &mut BTreeSet<QualityTier>, tier: QualityTier) {
    // "audio" is not a height; only video tiers come from descriptors.
    if tier.is_video() {
        tiers.insert(tier);
    }
}

/// The format ids picked for a tier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatSelection {
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl FormatSelection {
    /// `video+audio`, or the bare video id when there is no audio stream.
    pub fn selector(&self) -> String {
        let video = self.video.as_deref().unwrap_or_default();
        match &self.audio {
            Some(audio) => format!("{}+{}", video, audio),
            None => video.to_string(),
        }
    }
}

/// Picks the first matching video format and the first audio-only format.
pub fn select(formats: &[FormatDescriptor], tier: QualityTier) -> FormatSelection {
    let Some(height) = tier.height() else {
        return FormatSelection::default();
    };
    let needle = height.to_string();

    let video = formats
        .iter()
        .find(|f| {
            f.height == Some(height)
                || f.note_or_height().is_some_and(|note| note.contains(&needle))
        })
        .map(|f| f.format_id.clone());

    let audio = formats
        .iter()
        .find(|f| f.height.is_none())
        .map(|f| f.format_id.clone());

    FormatSelection { video, audio }
}

/// Format selector string for `-f`; empty for audio-only and unknown tiers.
pub fn resolve(formats: &[FormatDescriptor], tier: QualityTier) -> String {
    if !tier.is_video() {
        return String::new();
    }
    select(formats, tier).selector()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(id: &str, height: Option<u32>, note: Option<&str>) -> FormatDescriptor {
        FormatDescriptor {
            format_id: id.to_string(),
            height,
            url: String::new(),
            ext: "mp4".to_string(),
            note: note.map(str::to_string),
        }
    }

    #[test]
    fn labels_round_trip_and_unknown_is_sentinel() {
        for tier in QualityTier::ALL {
            assert_eq!(QualityTier::from_label(tier.label()), tier);
        }
        assert_eq!(QualityTier::from_label("2160"), QualityTier::Unknown);
        assert_eq!(QualityTier::from_label("unknown"), QualityTier::Unknown);
        assert_eq!("720p".parse::<QualityTier>().unwrap(), QualityTier::P720);
    }

    #[test]
    fn audio_available_iff_any_format() {
        assert!(available_tiers(&[]).is_empty());
        let tiers = available_tiers(&[fmt("251", None, Some("low"))]);
        assert!(tiers.contains(&QualityTier::AudioOnly));
        assert_eq!(tiers.len(), 1);
    }

    #[test]
    fn tiers_come_from_height_and_note() {
        let formats = [
            fmt("1", Some(480), None),
            fmt("2", None, Some("1080p")),
            fmt("3", Some(999), Some("weird")),
        ];
        let tiers = available_tiers(&formats);
        assert!(tiers.contains(&QualityTier::P480));
        assert!(tiers.contains(&QualityTier::P1080));
        assert!(!tiers.contains(&QualityTier::P720));
        assert!(!tiers.contains(&QualityTier::Unknown));
    }

    #[test]
    fn resolve_combines_first_video_and_first_audio() {
        let formats = [
            fmt("140", None, Some("medium")),
            fmt("136", Some(720), Some("720p")),
            fmt("398", Some(720), Some("720p60")),
            fmt("251", None, Some("high")),
        ];
        assert_eq!(resolve(&formats, QualityTier::P720), "136+140");
    }

    #[test]
    fn resolve_matches_note_substring() {
        let formats = [fmt("hls-1", Some(1078), Some("1080p HLS"))];
        assert_eq!(resolve(&formats, QualityTier::P1080), "hls-1");
    }

    #[test]
    fn resolve_without_match_never_panics() {
        let formats = [fmt("140", None, Some("medium"))];
        // No video match still yields the audio half; callers check
        // `select(..).video` before handing the selector to yt-dlp.
        assert_eq!(resolve(&formats, QualityTier::P1080), "+140");
        assert_eq!(resolve(&[], QualityTier::P1080), "");
        assert_eq!(resolve(&formats, QualityTier::AudioOnly), "");
        assert_eq!(resolve(&formats, QualityTier::Unknown), "");
        assert_eq!(select(&formats, QualityTier::P1080).video, None);
    }

    #[test]
    fn containers_split_into_audio_and_video() {
        let audio: Vec<_> = FileContainer::audio().collect();
        assert_eq!(audio, vec![FileContainer::Mp3, FileContainer::Wav]);
        assert!(FileContainer::video().all(|c| !c.is_audio()));
        assert!(FileContainer::Original.is_video());
        assert_eq!(".MP4".parse::<FileContainer>().unwrap(), FileContainer::Mp4);
        assert!("flac".parse::<FileContainer>().is_err());
    }
}
