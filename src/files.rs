//! Working directory, output discovery and final placement of downloads.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::locks::resilient_lock;

const BASE_NAME_LEN: usize = 12;

/// Scratch directory that yt-dlp and ffmpeg write into.
///
/// Lives as long as the orchestrator and is removed by [`WorkDir::close`].
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl WorkDir {
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("yt-dlp-queue-").tempdir()?;
        tracing::info!("Working directory: {}", dir.path().display());
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A random base name no file in the directory is using yet.
    pub fn new_base_name(&self) -> String {
        loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(BASE_NAME_LEN)
                .map(|b| char::from(b).to_ascii_lowercase())
                .collect();
            if self.entries_with_prefix(&candidate).is_empty() {
                return candidate;
            }
        }
    }

    /// Files named `<base>.<ext>` for any single extension.
    pub fn outputs_for(&self, base: &str) -> Vec<PathBuf> {
        self.entries()
            .filter(|path| path.file_stem().is_some_and(|stem| stem == base))
            .collect()
    }

    /// Deletes everything yt-dlp left behind for `base`, including `.part`
    /// and fragment files.
    pub async fn remove_partials(&self, base: &str) {
        for path in self.entries_with_prefix(base) {
            remove_if_exists(&path).await;
        }
    }

    /// Removes the directory and everything in it. Idempotent.
    pub fn close(&self) {
        let Some(dir) = resilient_lock(&self.dir).take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            tracing::warn!("Failed to remove working directory {}: {}", path.display(), e);
        } else {
            tracing::debug!("Removed working directory {}", path.display());
        }
    }

    fn entries(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(&self.path)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
    }

    fn entries_with_prefix(&self, prefix: &str) -> Vec<PathBuf> {
        self.entries()
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with(prefix))
            })
            .collect()
    }
}

/// Deletes a file, treating "not there" as success.
pub async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(windows)]
fn is_forbidden(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

#[cfg(not(windows))]
fn is_forbidden(c: char) -> bool {
    c == '/' || c == '\0'
}

/// Strips characters the host filesystem does not allow in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars().filter(|c| !is_forbidden(*c)).collect()
}

fn numbered(dir: &Path, stem: &str, extension: &str, n: usize) -> PathBuf {
    let stem = if n == 0 {
        stem.to_string()
    } else {
        format!("{}({})", stem, n)
    };
    if extension.is_empty() {
        dir.join(stem)
    } else {
        dir.join(format!("{}.{}", stem, extension))
    }
}

/// Moves `source` into `dir` as `<stem>.<ext>`, or `<stem>(1).<ext>`,
/// `<stem>(2).<ext>` ... when the name is taken.
///
/// The chosen name is claimed with a create-new open before the move, so two
/// placements racing for the same name never overwrite each other.
pub async fn place_file(source: &Path, dir: &Path, stem: &str) -> io::Result<PathBuf> {
    if !tokio::fs::try_exists(source).await? {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", source.display()),
        ));
    }
    tokio::fs::create_dir_all(dir).await?;

    let extension = source
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut n = 0;
    let target = loop {
        let candidate = numbered(dir, stem, &extension, n);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => break candidate,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    };

    if let Err(rename_err) = tokio::fs::rename(source, &target).await {
        // Typically the destination is on another filesystem than the temp dir.
        tracing::debug!("Rename into place failed ({}); copying instead", rename_err);
        if let Err(e) = tokio::fs::copy(source, &target).await {
            remove_if_exists(&target).await;
            return Err(e);
        }
        remove_if_exists(source).await;
    }

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_file_name("AC/DC - Live"), "ACDC - Live");
        assert_eq!(sanitize_file_name("plain title"), "plain title");
    }

    #[cfg(windows)]
    #[test]
    fn sanitize_strips_windows_reserved() {
        assert_eq!(sanitize_file_name("a<b>c:d\"e|f?g*h\\i"), "abcdefghi");
    }

    #[tokio::test]
    async fn placement_appends_counter_for_taken_names() {
        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let mut placed = Vec::new();
        for i in 0..3 {
            let source = work.path().join(format!("raw{}.mp4", i));
            std::fs::write(&source, format!("video {}", i)).unwrap();
            let target = place_file(&source, dest.path(), "X").await.unwrap();
            assert!(!source.exists());
            placed.push(target.file_name().unwrap().to_string_lossy().to_string());
        }

        assert_eq!(placed, vec!["X.mp4", "X(1).mp4", "X(2).mp4"]);
        assert_eq!(std::fs::read_to_string(dest.path().join("X(1).mp4")).unwrap(), "video 1");
    }

    #[tokio::test]
    async fn placement_of_missing_source_fails_without_reserving() {
        let dest = tempfile::tempdir().unwrap();
        let result = place_file(&dest.path().join("nope.mp4"), dest.path(), "X").await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(!dest.path().join("X.mp4").exists());
    }

    #[tokio::test]
    async fn placement_creates_destination_directory() {
        let work = tempfile::tempdir().unwrap();
        let source = work.path().join("abc.mkv");
        std::fs::write(&source, b"data").unwrap();
        let dest = work.path().join("nested").join("out");
        let target = place_file(&source, &dest, "Title").await.unwrap();
        assert_eq!(target, dest.join("Title.mkv"));
    }

    #[tokio::test]
    async fn outputs_match_exact_stem_only() {
        let work = WorkDir::create().unwrap();
        let base = work.new_base_name();
        assert_eq!(base.len(), BASE_NAME_LEN);

        std::fs::write(work.path().join(format!("{}.webm", base)), b"").unwrap();
        std::fs::write(work.path().join(format!("{}.f137.mp4.part", base)), b"").unwrap();
        std::fs::write(work.path().join("other.webm"), b"").unwrap();

        let outputs = work.outputs_for(&base);
        assert_eq!(outputs, vec![work.path().join(format!("{}.webm", base))]);

        work.remove_partials(&base).await;
        assert!(work.outputs_for(&base).is_empty());
        assert!(work.path().join("other.webm").exists());

        let path = work.path().to_path_buf();
        work.close();
        work.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn removing_missing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        remove_if_exists(&dir.path().join("ghost")).await;
    }
}
