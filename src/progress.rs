//! Line parsers for yt-dlp and ffmpeg progress output.

use once_cell::sync::Lazy;
use regex::Regex;

static PERCENT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9.]*%").unwrap());
static SPEED_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"at.*s").unwrap());
static ETA_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"ETA \S+").unwrap());

static SIZE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"size=.*x").unwrap());
static TIMESTAMP_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d\d):(\d\d):(\d\d)\.(\d\d)").unwrap());
static FFMPEG_SPEED_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"speed=.*x").unwrap());

/// A `[download]` progress line from yt-dlp.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub percent: f64,
    pub speed: String,
    pub eta: Option<String>,
}

/// A `-stats` line from ffmpeg, relative to the total media duration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionProgress {
    pub percent: f64,
    pub remaining_secs: Option<u64>,
}

impl ConversionProgress {
    pub fn remaining(&self) -> Option<String> {
        self.remaining_secs.map(format_remaining_time)
    }
}

/// yt-dlp reports failures as `ERROR: ...`; anything mentioning ERROR is fatal.
pub fn is_download_error(line: &str) -> bool {
    line.contains("ERROR")
}

pub fn is_metadata_error(line: &str) -> bool {
    line.contains("ERROR:")
}

/// Parses lines such as
/// `[download]  45.3% of 12.50MiB at  1.20MiB/s ETA 00:06`.
///
/// Returns `None` for anything that is not a usable progress line.
pub fn parse_download_line(line: &str) -> Option<DownloadProgress> {
    if !line.contains("[download]") {
        return None;
    }

    let percent = PERCENT_REGEX.find(line)?.as_str();
    let speed = SPEED_REGEX.find(line)?.as_str();
    if percent.is_empty() || speed.is_empty() {
        return None;
    }

    let percent: f64 = percent.trim_end_matches('%').parse().ok()?;
    let speed = speed.get(3..).unwrap_or_default().trim().to_string();
    let eta = ETA_REGEX
        .find(line)
        .map(|m| m.as_str()[3..].trim().to_string());

    Some(DownloadProgress { percent, speed, eta })
}

/// Parses ffmpeg stats lines such as
/// `size=    1024kB time=00:01:05.20 bitrate= 128.0kbits/s speed=2.5x`.
///
/// `total_secs` is the duration of the whole media.
pub fn parse_conversion_line(line: &str, total_secs: f64) -> Option<ConversionProgress> {
    SIZE_REGEX.find(line)?;

    let elapsed = parse_timestamp(line).unwrap_or(0.0);
    let speed = FFMPEG_SPEED_REGEX.find(line).and_then(|m| {
        let raw = m.as_str();
        raw["speed=".len()..raw.len() - 1].trim().parse::<f64>().ok()
    });

    let percent = if total_secs > 0.0 {
        elapsed / total_secs * 100.0
    } else {
        0.0
    };

    let remaining_secs = match speed {
        Some(speed) if speed > 0.0 => Some(((total_secs - elapsed) / speed).round().max(0.0) as u64),
        _ => None,
    };

    Some(ConversionProgress { percent, remaining_secs })
}

/// First `HH:MM:SS.cc` timestamp on the line, in seconds.
pub fn parse_timestamp(line: &str) -> Option<f64> {
    let caps = TIMESTAMP_REGEX.captures(line)?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
    Some(part(1)? * 3600.0 + part(2)? * 60.0 + part(3)? + part(4)? / 100.0)
}

/// Compact remaining-time string: `3661 -> "01h.01m.01s"`, `61 -> "01m.01s"`,
/// `9 -> "9s"`.
pub fn format_remaining_time(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs / 60) % 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{:02}h.", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{:02}m.", minutes));
        out.push_str(&format!("{:02}s", seconds));
    } else {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_time_drops_empty_leading_units() {
        assert_eq!(format_remaining_time(3661), "01h.01m.01s");
        assert_eq!(format_remaining_time(61), "01m.01s");
        assert_eq!(format_remaining_time(45), "45s");
        assert_eq!(format_remaining_time(9), "9s");
        assert_eq!(format_remaining_time(0), "0s");
        assert_eq!(format_remaining_time(3600), "01h.00m.00s");
        assert_eq!(format_remaining_time(36_005), "10h.00m.05s");
    }

    #[test]
    fn download_line_with_eta() {
        let line = "[download]  45.3% of 12.50MiB at  1.20MiB/s ETA 00:06";
        let progress = parse_download_line(line).unwrap();
        assert_eq!(progress.percent, 45.3);
        assert_eq!(progress.speed, "1.20MiB/s");
        assert_eq!(progress.eta.as_deref(), Some("00:06"));
    }

    #[test]
    fn download_line_without_eta_still_counts() {
        let line = "[download] 100% of 12.50MiB at  3.00MiB/s";
        let progress = parse_download_line(line).unwrap();
        assert_eq!(progress.percent, 100.0);
        assert_eq!(progress.eta, None);
    }

    #[test]
    fn non_progress_lines_are_discarded() {
        assert_eq!(parse_download_line("[youtube] abc: Downloading webpage"), None);
        assert_eq!(parse_download_line("[download] Destination: /tmp/x.mp4"), None);
        assert_eq!(parse_download_line("[download] 12.0% of 1MiB"), None);
    }

    #[test]
    fn error_detection() {
        assert!(is_download_error("ERROR: unable to download video data"));
        assert!(is_metadata_error("ERROR: Video unavailable"));
        assert!(!is_metadata_error("WARNING: ERRORS ahead"));
    }

    #[test]
    fn conversion_line_reports_percent_and_remaining() {
        let line = "size=    1024kB time=00:01:00.00 bitrate= 139.8kbits/s speed=2.0x";
        let progress = parse_conversion_line(line, 240.0).unwrap();
        assert_eq!(progress.percent, 25.0);
        assert_eq!(progress.remaining_secs, Some(90));
        assert_eq!(progress.remaining().as_deref(), Some("01m.30s"));
    }

    #[test]
    fn conversion_line_with_zero_speed_has_unknown_remaining() {
        let line = "size=       0kB time=00:00:00.00 bitrate=N/A speed=0x";
        let progress = parse_conversion_line(line, 100.0).unwrap();
        assert_eq!(progress.percent, 0.0);
        assert_eq!(progress.remaining_secs, None);
    }

    #[test]
    fn conversion_line_past_the_end_clamps_to_zero() {
        let line = "size=    2048kB time=00:02:10.00 bitrate= 128.0kbits/s speed=10x";
        let progress = parse_conversion_line(line, 120.0).unwrap();
        assert_eq!(progress.remaining_secs, Some(0));
    }

    #[test]
    fn lines_without_size_are_not_progress() {
        assert_eq!(parse_conversion_line("Guessed Channel Layout for Input Stream #0.0", 10.0), None);
        assert_eq!(parse_conversion_line("size=N/A time=00:00:01.00", 10.0), None);
    }

    #[test]
    fn timestamp_parsing() {
        assert_eq!(parse_timestamp("time=01:02:03.50"), Some(3723.5));
        assert_eq!(parse_timestamp("no time here"), None);
    }
}
