//! yt-dlp invocation and output parsing.
//!
//! Every operation builds a fixed argument vector and runs yt-dlp directly,
//! never through a shell, so untrusted queries, ids, and titles cannot be
//! interpreted as command syntax. Search results come back as one JSON
//! object per stdout line; stream resolution prints the direct URL followed
//! by one metadata line.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

use crate::error::{Result, ServiceError};

const YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_SEARCH_LIMIT: u32 = 10;
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_TITLE: &str = "Unknown Title";

/// Cap on captured stdout. Metadata dumps can be enormous; anything past the
/// cap is drained and discarded so the child never blocks on a full pipe.
const MAX_CAPTURED_STDOUT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub video_id: String,
    pub title: String,
    pub artist: String,
    pub duration: i64,
    pub thumbnail: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_url: String,
    pub video_id: String,
    pub title: String,
    pub artist: String,
    pub duration: i64,
    pub thumbnail: String,
}

/// Subset of a yt-dlp JSON line. Everything is optional because older or
/// region-locked videos routinely lack fields.
#[derive(Debug, Deserialize)]
struct RawEntry {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Option<Vec<RawThumbnail>>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

impl RawEntry {
    fn artist(&self) -> String {
        self.uploader
            .clone()
            .or_else(|| self.channel.clone())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| UNKNOWN_ARTIST.to_owned())
    }

    fn duration_seconds(&self) -> i64 {
        self.duration.map(|value| value as i64).unwrap_or(0)
    }

    fn thumbnail_url(&self) -> String {
        self.thumbnail
            .clone()
            .or_else(|| {
                self.thumbnails
                    .as_ref()
                    .and_then(|list| list.first())
                    .and_then(|thumb| thumb.url.clone())
            })
            .unwrap_or_default()
    }
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Searches YouTube and returns up to `limit` results.
pub async fn search(query: &str, limit: u32) -> Result<Vec<SearchResult>> {
    let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };

    let mut command = Command::new(YTDLP_BIN);
    command
        .arg("--dump-json")
        .arg("--skip-download")
        .arg(format!("ytsearch{limit}:{query}"));

    let output = run_checked(command, "search").await?;
    parse_search_output(&output.stdout)
}

/// Resolves the best-audio direct URL for a video, plus its metadata.
pub async fn resolve_stream(video_id: &str) -> Result<StreamInfo> {
    let mut command = Command::new(YTDLP_BIN);
    command
        .arg("-f")
        .arg("bestaudio")
        .arg("--get-url")
        .arg("--dump-json")
        .arg(watch_url(video_id));

    let output = run_checked(command, "stream resolution").await?;
    parse_stream_output(&output.stdout, video_id)
}

/// Downloads a video's audio track and converts it to MP3 at best quality.
/// The template carries yt-dlp's `%(ext)s` placeholder so the ffmpeg
/// postprocessor lands on the final `.mp3` name.
pub async fn download_audio(video_id: &str, output_template: &Path) -> Result<()> {
    let mut command = Command::new(YTDLP_BIN);
    command
        .arg("-x")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--audio-quality")
        .arg("0")
        .arg("-o")
        .arg(output_template)
        .arg(watch_url(video_id));

    run_checked(command, "download").await?;
    Ok(())
}

/// Runs `<name> <version_flag>` to fail loudly when external dependencies
/// are missing from PATH.
pub async fn ensure_tool_available(name: &str, version_flag: &str) -> Result<()> {
    let status = Command::new(name)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(ServiceError::ExternalTool {
            message: format!("{name} is installed but returned status {status}"),
            stderr: String::new(),
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ServiceError::ToolNotFound(name.to_owned()))
        }
        Err(err) => Err(err.into()),
    }
}

struct ToolOutput {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

/// Spawns the command, captures stdout up to the cap and stderr in full, and
/// turns a non-zero exit into an `ExternalTool` error carrying stderr.
async fn run_checked(command: Command, context: &str) -> Result<ToolOutput> {
    let output = run_captured(command).await?;
    log_tool_stderr(&output.stderr);

    if !output.status.success() {
        let status = output.status;
        let excerpt = stderr_excerpt(&output.stderr);
        return Err(ServiceError::ExternalTool {
            message: if excerpt.is_empty() {
                format!("yt-dlp {context} failed (status {status})")
            } else {
                format!("yt-dlp {context} failed (status {status}): {excerpt}")
            },
            stderr: output.stderr,
        });
    }

    Ok(output)
}

async fn run_captured(mut command: Command) -> Result<ToolOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ServiceError::ToolNotFound(YTDLP_BIN.to_owned())
        } else {
            ServiceError::Io(err)
        }
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let stdout_read = async {
        match stdout_pipe.as_mut() {
            Some(pipe) => {
                let mut limited = pipe.take(MAX_CAPTURED_STDOUT);
                limited.read_to_end(&mut stdout).await?;
                // Drain anything past the cap so the child can finish.
                tokio::io::copy(limited.get_mut(), &mut tokio::io::sink()).await?;
                Ok::<(), std::io::Error>(())
            }
            None => Ok(()),
        }
    };
    let stderr_read = async {
        match stderr_pipe.as_mut() {
            Some(pipe) => pipe.read_to_end(&mut stderr).await.map(|_| ()),
            None => Ok(()),
        }
    };

    let (stdout_result, stderr_result) = tokio::join!(stdout_read, stderr_read);
    stdout_result?;
    stderr_result?;

    let status = child.wait().await?;

    Ok(ToolOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// yt-dlp exits 0 while still printing incidental warnings. Those are
/// ignorable; anything else on stderr is surfaced in the log.
fn log_tool_stderr(stderr: &str) {
    for line in stderr.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.contains("WARNING") {
            continue;
        }
        warn!("yt-dlp: {trimmed}");
    }
}

fn stderr_excerpt(stderr: &str) -> String {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("WARNING"))
        .last()
        .unwrap_or_default()
        .to_owned()
}

/// Parses newline-delimited search JSON. Blank lines are skipped; a line
/// that is not valid JSON fails the whole call.
pub fn parse_search_output(stdout: &str) -> Result<Vec<SearchResult>> {
    let mut results = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let raw: RawEntry = serde_json::from_str(line)?;
        let video_id = raw.id.clone().unwrap_or_default();
        results.push(SearchResult {
            url: watch_url(&video_id),
            title: raw.title.clone().unwrap_or_else(|| video_id.clone()),
            artist: raw.artist(),
            duration: raw.duration_seconds(),
            thumbnail: raw.thumbnail_url(),
            video_id,
        });
    }

    Ok(results)
}

/// First line is the raw stream URL; the second, when present, is one JSON
/// metadata object. Missing metadata falls back to sentinel values.
pub fn parse_stream_output(stdout: &str, video_id: &str) -> Result<StreamInfo> {
    let mut lines = stdout.trim().lines();

    let stream_url = lines
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ServiceError::ExternalTool {
            message: format!("yt-dlp returned no stream URL for {video_id}"),
            stderr: String::new(),
        })?;

    match lines.next() {
        Some(meta_line) => {
            let raw: RawEntry = serde_json::from_str(meta_line)?;
            Ok(StreamInfo {
                stream_url: stream_url.to_owned(),
                title: raw
                    .title
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_TITLE.to_owned()),
                artist: raw.artist(),
                duration: raw.duration_seconds(),
                thumbnail: raw.thumbnail_url(),
                video_id: raw.id.clone().unwrap_or_else(|| video_id.to_owned()),
            })
        }
        None => Ok(StreamInfo {
            stream_url: stream_url.to_owned(),
            video_id: video_id.to_owned(),
            title: UNKNOWN_TITLE.to_owned(),
            artist: UNKNOWN_ARTIST.to_owned(),
            duration: 0,
            thumbnail: String::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_search_maps_fields() -> Result<()> {
        let stdout = concat!(
            r#"{"id":"abc123","title":"First Song","uploader":"Some Artist","duration":215.0,"thumbnail":"https://img/1.jpg"}"#,
            "\n",
            r#"{"id":"def456","title":"Second Song","channel":"Channel Name","thumbnails":[{"url":"https://img/2.jpg"}]}"#,
            "\n",
        );

        let results = parse_search_output(stdout)?;
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].video_id, "abc123");
        assert_eq!(results[0].artist, "Some Artist");
        assert_eq!(results[0].duration, 215);
        assert_eq!(results[0].thumbnail, "https://img/1.jpg");
        assert_eq!(results[0].url, "https://www.youtube.com/watch?v=abc123");

        // channel is the uploader fallback; missing duration defaults to 0
        // and the thumbnail comes from the thumbnails list.
        assert_eq!(results[1].artist, "Channel Name");
        assert_eq!(results[1].duration, 0);
        assert_eq!(results[1].thumbnail, "https://img/2.jpg");
        Ok(())
    }

    #[test]
    fn parse_search_defaults_missing_metadata() -> Result<()> {
        let results = parse_search_output(r#"{"id":"xyz"}"#)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "xyz");
        assert_eq!(results[0].artist, UNKNOWN_ARTIST);
        assert_eq!(results[0].duration, 0);
        assert_eq!(results[0].thumbnail, "");
        Ok(())
    }

    #[test]
    fn parse_search_skips_blank_lines() -> Result<()> {
        let stdout = "\n  \n{\"id\":\"abc\"}\n\n";
        let results = parse_search_output(stdout)?;
        assert_eq!(results.len(), 1);
        Ok(())
    }

    #[test]
    fn parse_search_rejects_malformed_line() {
        let stdout = "{\"id\":\"ok\"}\nnot json at all\n";
        let err = parse_search_output(stdout).unwrap_err();
        assert!(matches!(err, ServiceError::OutputParse(_)));
    }

    #[test]
    fn parse_stream_reads_url_and_metadata() -> Result<()> {
        let stdout = concat!(
            "https://cdn.example/audio.webm?expire=123\n",
            r#"{"id":"abc123","title":"My Song","channel":"Artist","duration":180}"#,
            "\n",
        );

        let info = parse_stream_output(stdout, "abc123")?;
        assert_eq!(info.stream_url, "https://cdn.example/audio.webm?expire=123");
        assert_eq!(info.title, "My Song");
        assert_eq!(info.artist, "Artist");
        assert_eq!(info.duration, 180);
        Ok(())
    }

    #[test]
    fn parse_stream_falls_back_without_metadata() -> Result<()> {
        let info = parse_stream_output("https://cdn.example/audio\n", "abc123")?;
        assert_eq!(info.video_id, "abc123");
        assert_eq!(info.title, UNKNOWN_TITLE);
        assert_eq!(info.artist, UNKNOWN_ARTIST);
        assert_eq!(info.duration, 0);
        assert_eq!(info.thumbnail, "");
        Ok(())
    }

    #[test]
    fn parse_stream_requires_a_url() {
        let err = parse_stream_output("\n\n", "abc123").unwrap_err();
        assert!(matches!(err, ServiceError::ExternalTool { .. }));
    }

    #[test]
    fn stderr_excerpt_skips_warnings() {
        let stderr = "WARNING: throttled\nERROR: video unavailable\n";
        assert_eq!(stderr_excerpt(stderr), "ERROR: video unavailable");
        assert_eq!(stderr_excerpt("WARNING: only warnings\n"), "");
    }
}
