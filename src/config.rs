use anyhow::{anyhow, Result};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::orchestrator::{validate_tool_path, Settings, DEFAULT_SOCKET_TIMEOUT_SECS};

/// The structure of our configuration file (config.toml)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub download_directory: String,
    /// Path to yt-dlp; looked up on PATH when unset.
    #[serde(default)]
    pub ytdlp_path: Option<String>,
    /// Path to ffmpeg; looked up on PATH when unset.
    #[serde(default)]
    pub ffmpeg_path: Option<String>,
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
}

fn default_socket_timeout() -> u64 {
    DEFAULT_SOCKET_TIMEOUT_SECS
}

/// The user's download directory, or `./downloads` when there is none.
pub fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            download_directory: default_download_dir().to_string_lossy().to_string(),
            ytdlp_path: None,
            ffmpeg_path: None,
            socket_timeout_secs: DEFAULT_SOCKET_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Builds worker settings, rejecting tool paths that do not exist.
    pub fn to_settings(&self) -> crate::error::Result<Settings> {
        let defaults = Settings::default();
        let downloader = match &self.ytdlp_path {
            Some(path) => validate_tool_path(Path::new(path))?,
            None => defaults.downloader,
        };
        let converter = match &self.ffmpeg_path {
            Some(path) => validate_tool_path(Path::new(path))?,
            None => defaults.converter,
        };
        Ok(Settings {
            downloader,
            converter,
            destination: PathBuf::from(&self.download_directory),
            socket_timeout_secs: self.socket_timeout_secs,
        })
    }
}

/// Returns the cross-platform path to the configuration file, creating the directory if needed.
pub async fn get_config_path() -> Result<PathBuf> {
    let project_dirs = ProjectDirs::from("org", "yt-dlp-queue", "yt-dlp-queue")
        .ok_or_else(|| anyhow!("Could not find a valid home directory to store config"))?;

    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir).await?;

    Ok(config_dir.join("config.toml"))
}

/// Loads the configuration from the file, or creates a default one if it doesn't exist.
pub async fn load_config() -> Result<Config> {
    let config_path = get_config_path().await?;

    if !config_path.exists() {
        tracing::info!(
            "No config file found. Creating a default one at: {}",
            config_path.display()
        );
        let default_config = Config::default();
        save_config(&default_config).await?;
        return Ok(default_config);
    }

    let config_content = fs::read_to_string(&config_path).await?;
    parse_config(&config_content)
        .map_err(|e| anyhow!("Failed to parse config file at {}: {}", config_path.display(), e))
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Saves the provided configuration object to the file.
pub async fn save_config(config: &Config) -> Result<()> {
    let config_path = get_config_path().await?;
    let toml_string = toml::to_string_pretty(config)?;
    fs::write(config_path, toml_string).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn minimal_file_gets_defaults() {
        let config = parse_config("download_directory = \"/data/videos\"\n").unwrap();
        assert_eq!(config.download_directory, "/data/videos");
        assert_eq!(config.ytdlp_path, None);
        assert_eq!(config.socket_timeout_secs, 10);

        let settings = config.to_settings().unwrap();
        assert_eq!(settings.downloader, PathBuf::from("yt-dlp"));
        assert_eq!(settings.destination, PathBuf::from("/data/videos"));
    }

    #[test]
    fn config_survives_toml_round_trip() {
        let config = Config {
            download_directory: "/tmp/out".to_string(),
            ytdlp_path: Some("/usr/bin/yt-dlp".to_string()),
            ffmpeg_path: None,
            socket_timeout_secs: 30,
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(parse_config(&text).unwrap(), config);
    }

    #[test]
    fn missing_tool_in_config_is_path_not_found() {
        let config = Config {
            ffmpeg_path: Some("/nowhere/ffmpeg".to_string()),
            ..Config::default()
        };
        assert!(matches!(config.to_settings(), Err(Error::PathNotFound(_))));
    }
}
