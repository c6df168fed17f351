//! Flat MP3 library derived from the downloads directory.
//!
//! Filenames are the only persisted state: every downloaded song lands at
//! `{videoId}_{sanitizedTitle}.mp3` and the catalog is rebuilt from a
//! directory listing on each request. There is no index to fall out of sync.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::ytdlp;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub video_id: String,
    pub title: String,
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub filename: String,
    pub already_exists: bool,
}

#[derive(Debug, Clone)]
pub struct Library {
    downloads_dir: PathBuf,
}

impl Library {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Lists every `.mp3` in the downloads directory, creating the directory
    /// first so a fresh deployment starts with an empty catalog instead of
    /// an error. Order follows filesystem enumeration and is not stable.
    pub async fn list(&self) -> Result<Vec<LibraryEntry>> {
        fs::create_dir_all(&self.downloads_dir).await?;

        let mut songs = Vec::new();
        let mut dir = fs::read_dir(&self.downloads_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_name = entry
                .file_name()
                .into_string()
                .unwrap_or_else(|os| os.to_string_lossy().into_owned());
            if !file_name.ends_with(".mp3") {
                continue;
            }
            songs.push(entry_from_filename(file_name));
        }

        Ok(songs)
    }

    /// Unlinks a song by filename. The HTTP layer validates the filename
    /// before calling this; no traversal checks happen here.
    pub async fn delete(&self, filename: &str) -> Result<()> {
        let path = self.downloads_dir.join(filename);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("deleted {filename}");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ServiceError::NotFound(format!("no such song: {filename}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Downloads a video as MP3, keyed on the derived filename. A file that
    /// already exists short-circuits without invoking yt-dlp; two requests
    /// racing past that check both spawn the tool and the last writer wins
    /// on the same target name.
    pub async fn download(&self, video_id: &str, title: &str) -> Result<DownloadResult> {
        let filename = target_filename(video_id, title);
        let target = self.downloads_dir.join(&filename);

        if fs::try_exists(&target).await? {
            info!("already downloaded: {filename}");
            return Ok(DownloadResult {
                filename,
                already_exists: true,
            });
        }

        fs::create_dir_all(&self.downloads_dir).await?;

        let template = target.with_extension("%(ext)s");
        info!("downloading {title} ({video_id})");
        ytdlp::download_audio(video_id, &template).await?;
        info!("download complete: {filename}");

        Ok(DownloadResult {
            filename,
            already_exists: false,
        })
    }
}

/// Strips everything outside `[A-Za-z0-9 -]` and collapses whitespace runs
/// to single underscores, producing a filesystem-safe title component.
pub fn sanitize_title(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join("_")
}

pub fn target_filename(video_id: &str, title: &str) -> String {
    format!("{video_id}_{}.mp3", sanitize_title(title))
}

/// Recovers `(videoId, title)` from a `{videoId}_{title}.mp3` name by
/// splitting on the first underscore. Names without one use the whole stem
/// as both id and title.
fn entry_from_filename(filename: String) -> LibraryEntry {
    let stem = filename.strip_suffix(".mp3").unwrap_or(&filename);

    let (video_id, title) = match stem.split_once('_') {
        Some((id, title_part)) if !id.is_empty() && !title_part.is_empty() => {
            (id.to_owned(), title_part.replace('_', " "))
        }
        _ => (stem.to_owned(), stem.replace('_', " ")),
    };

    let url = format!("/song/{filename}");
    LibraryEntry {
        video_id,
        title,
        filename,
        url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_strips_punctuation_and_joins_with_underscores() {
        assert_eq!(sanitize_title("My Song!"), "My_Song");
        assert_eq!(sanitize_title("Song: Remix (Live)"), "Song_Remix_Live");
        assert_eq!(sanitize_title("a\tb  c"), "a_b_c");
        assert_eq!(sanitize_title("dash-ok"), "dash-ok");
        assert_eq!(sanitize_title("!!!"), "");
    }

    #[test]
    fn target_filename_is_deterministic() {
        assert_eq!(target_filename("abc123", "My Song!"), "abc123_My_Song.mp3");
        assert_eq!(target_filename("abc123", "My Song!"), "abc123_My_Song.mp3");
    }

    #[test]
    fn entry_parses_id_and_title() {
        let entry = entry_from_filename("abc123_My_Song.mp3".into());
        assert_eq!(entry.video_id, "abc123");
        assert_eq!(entry.title, "My Song");
        assert_eq!(entry.filename, "abc123_My_Song.mp3");
        assert_eq!(entry.url, "/song/abc123_My_Song.mp3");
    }

    #[test]
    fn entry_without_underscore_uses_stem_for_both() {
        let entry = entry_from_filename("abc123.mp3".into());
        assert_eq!(entry.video_id, "abc123");
        assert_eq!(entry.title, "abc123");
    }

    #[test]
    fn entry_with_leading_underscore_falls_back() {
        let entry = entry_from_filename("_orphan.mp3".into());
        assert_eq!(entry.video_id, "_orphan");
        assert_eq!(entry.title, " orphan");
    }

    #[test]
    fn sanitized_title_round_trips_through_listing() {
        let filename = target_filename("abc123", "My Song!");
        let entry = entry_from_filename(filename);
        assert_eq!(entry.title, "My Song");
    }

    #[tokio::test]
    async fn list_creates_directory_and_returns_empty() -> Result<()> {
        let dir = tempdir().unwrap();
        let library = Library::new(dir.path().join("downloads"));
        let songs = library.list().await?;
        assert!(songs.is_empty());
        assert!(dir.path().join("downloads").exists());
        Ok(())
    }

    #[tokio::test]
    async fn list_skips_non_mp3_files() -> Result<()> {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("abc_Song.mp3"), b"bytes").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"bytes").unwrap();

        let library = Library::new(dir.path());
        let songs = library.list().await?;
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].video_id, "abc");
        assert_eq!(songs[0].title, "Song");
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_file_and_reports_missing() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc_Song.mp3");
        std::fs::write(&path, b"bytes").unwrap();

        let library = Library::new(dir.path());
        library.delete("abc_Song.mp3").await?;
        assert!(!path.exists());

        let err = library.delete("abc_Song.mp3").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn download_short_circuits_on_existing_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let filename = target_filename("abc123", "My Song!");
        std::fs::write(dir.path().join(&filename), b"bytes").unwrap();

        // The file already exists, so no yt-dlp invocation happens and the
        // call reports the short-circuit.
        let library = Library::new(dir.path());
        let result = library.download("abc123", "My Song!").await?;
        assert!(result.already_exists);
        assert_eq!(result.filename, filename);
        Ok(())
    }
}
