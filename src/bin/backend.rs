//! HTTP server exposing the Spotit music API.
//!
//! Thin façade over yt-dlp and the downloads directory: handlers validate
//! request parameters, delegate to the invoker or the library store, and
//! translate failures into a uniform `{error, message}` JSON envelope.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use spotit_backend::config::ServerConfig;
use spotit_backend::error::ServiceError;
use spotit_backend::library::{Library, LibraryEntry};
use spotit_backend::ytdlp::{self, SearchResult, StreamInfo};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::signal;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "spotit-backend";
const AUDIO_MIME: &str = "audio/mpeg";

#[derive(Clone)]
struct AppState {
    library: Arc<Library>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: String,
    message: Option<String>,
}

impl ApiError {
    fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            message: None,
        }
    }

    fn not_found(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: error.into(),
            message: None,
        }
    }

    fn internal(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            message: Some(message.into()),
        }
    }

    /// Maps a delegate failure onto the HTTP taxonomy. `label` names the
    /// failed operation in the envelope, as in "Search failed".
    fn from_service(label: &str, err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(message) => Self::bad_request(message),
            ServiceError::NotFound(message) => Self {
                status: StatusCode::NOT_FOUND,
                error: label.to_owned(),
                message: Some(message),
            },
            other => Self::internal(label, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.error });
        if let Some(message) = self.message {
            body["message"] = serde_json::Value::String(message);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = ServerConfig::from_env();

    // The search/stream/download endpoints need these on PATH; the library
    // endpoints work without them, so a missing tool is a warning only.
    for (tool, version_flag) in [("yt-dlp", "--version"), ("ffmpeg", "-version")] {
        if let Err(err) = ytdlp::ensure_tool_available(tool, version_flag).await {
            warn!("{err}");
        }
    }

    let library = Library::new(config.downloads_dir.clone());
    let app = router(library);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("parsing listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");
    info!("downloads directory: {}", config.downloads_dir.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

fn router(library: Library) -> Router {
    let state = AppState {
        library: Arc::new(library),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(api_index))
        .route("/health", get(health))
        .route("/search", get(search))
        .route("/stream", get(stream))
        .route("/download", post(download))
        .route("/library", get(list_library))
        .route("/song/{filename}", get(serve_song).delete(delete_song))
        .fallback(endpoint_not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// === Request/response types ===

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    success: bool,
    count: usize,
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamParams {
    video_id: Option<String>,
}

#[derive(Serialize)]
struct StreamResponse {
    success: bool,
    #[serde(flatten)]
    info: StreamInfo,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    video_id: Option<String>,
    title: Option<String>,
}

#[derive(Serialize)]
struct DownloadResponse {
    success: bool,
    message: String,
    filename: String,
    url: String,
}

#[derive(Serialize)]
struct LibraryResponse {
    success: bool,
    count: usize,
    songs: Vec<LibraryEntry>,
}

#[derive(Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

// === Handlers ===

async fn api_index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Spotit Backend API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "search": "GET /search?q=<query>&limit=<number>",
            "stream": "GET /stream?videoId=<id>",
            "download": "POST /download (body: {videoId, title})",
            "library": "GET /library",
            "deleteSong": "DELETE /song/{filename}",
            "serveSong": "GET /song/{filename}",
            "health": "GET /health",
        },
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    }))
}

async fn endpoint_not_found(uri: Uri) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        error: "Endpoint not found".to_owned(),
        message: Some(uri.path().to_owned()),
    }
}

async fn search(Query(params): Query<SearchParams>) -> ApiResult<Json<SearchResponse>> {
    let query = params
        .q
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing required parameter: q (query)"))?;

    // Non-numeric or non-positive limits silently fall back to the default.
    let limit = params
        .limit
        .as_deref()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(ytdlp::DEFAULT_SEARCH_LIMIT);

    let results = ytdlp::search(&query, limit)
        .await
        .map_err(|err| ApiError::from_service("Search failed", err))?;

    Ok(Json(SearchResponse {
        success: true,
        count: results.len(),
        results,
    }))
}

async fn stream(Query(params): Query<StreamParams>) -> ApiResult<Json<StreamResponse>> {
    let video_id = params
        .video_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing required parameter: videoId"))?;

    let info = ytdlp::resolve_stream(&video_id)
        .await
        .map_err(|err| ApiError::from_service("Failed to get stream URL", err))?;

    Ok(Json(StreamResponse {
        success: true,
        info,
    }))
}

async fn download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadResponse>> {
    let (video_id, title) = match (
        request.video_id.filter(|v| !v.is_empty()),
        request.title.filter(|v| !v.is_empty()),
    ) {
        (Some(video_id), Some(title)) => (video_id, title),
        _ => {
            return Err(ApiError::bad_request(
                "Missing required parameters: videoId and title",
            ));
        }
    };

    let result = state
        .library
        .download(&video_id, &title)
        .await
        .map_err(|err| ApiError::from_service("Download failed", err))?;

    let message = if result.already_exists {
        "File already exists"
    } else {
        "Download complete"
    };

    Ok(Json(DownloadResponse {
        success: true,
        message: message.to_owned(),
        url: format!("/song/{}", result.filename),
        filename: result.filename,
    }))
}

async fn list_library(State(state): State<AppState>) -> ApiResult<Json<LibraryResponse>> {
    let songs = state
        .library
        .list()
        .await
        .map_err(|err| ApiError::from_service("Failed to get library", err))?;

    Ok(Json(LibraryResponse {
        success: true,
        count: songs.len(),
        songs,
    }))
}

async fn delete_song(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Json<MessageResponse>> {
    reject_traversal(&filename)?;

    state
        .library
        .delete(&filename)
        .await
        .map_err(|err| ApiError::from_service("Delete failed", err))?;

    Ok(Json(MessageResponse {
        success: true,
        message: "Song deleted successfully".to_owned(),
    }))
}

async fn serve_song(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    reject_traversal(&filename)?;
    if !filename.ends_with(".mp3") {
        return Err(ApiError::bad_request("Only MP3 files are supported"));
    }

    let path = state.library.downloads_dir().join(&filename);
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let total = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal("Failed to read file", err.to_string()))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| parse_byte_range(value, total))
        .unwrap_or(ByteRange::Full);

    stream_song(file, total, range).await
}

/// Path traversal is checked before any filesystem access.
fn reject_traversal(filename: &str) -> ApiResult<()> {
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    Full,
    Segment { start: u64, end: u64 },
    Unsatisfiable,
}

/// Understands the single-range forms `bytes=a-b`, `bytes=a-`, and
/// `bytes=-n`. Multi-range and malformed headers degrade to a full
/// response; in-bounds syntax pointing past the end is unsatisfiable.
fn parse_byte_range(value: &str, total: u64) -> ByteRange {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let start_raw = start_raw.trim();
    let end_raw = end_raw.trim();

    if start_raw.is_empty() {
        // Suffix form: the last N bytes.
        return match end_raw.parse::<u64>() {
            Ok(n) if n > 0 && total > 0 => ByteRange::Segment {
                start: total.saturating_sub(n),
                end: total - 1,
            },
            Ok(_) => ByteRange::Unsatisfiable,
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return ByteRange::Full;
    };
    if start >= total {
        return ByteRange::Unsatisfiable;
    }

    let end = if end_raw.is_empty() {
        total - 1
    } else {
        match end_raw.parse::<u64>() {
            Ok(end) => end.min(total - 1),
            Err(_) => return ByteRange::Full,
        }
    };

    if end < start {
        return ByteRange::Full;
    }
    ByteRange::Segment { start, end }
}

async fn stream_song(mut file: File, total: u64, range: ByteRange) -> ApiResult<Response> {
    match range {
        ByteRange::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            insert_header(&mut response, header::CONTENT_RANGE, format!("bytes */{total}"));
            Ok(response)
        }
        ByteRange::Full => {
            let stream = ReaderStream::new(file);
            let mut response = Body::from_stream(stream).into_response();
            insert_header(&mut response, header::CONTENT_TYPE, AUDIO_MIME.to_owned());
            insert_header(&mut response, header::ACCEPT_RANGES, "bytes".to_owned());
            insert_header(&mut response, header::CONTENT_LENGTH, total.to_string());
            Ok(response)
        }
        ByteRange::Segment { start, end } => {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal("Failed to read file", err.to_string()))?;
            let length = end - start + 1;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            insert_header(&mut response, header::CONTENT_TYPE, AUDIO_MIME.to_owned());
            insert_header(&mut response, header::ACCEPT_RANGES, "bytes".to_owned());
            insert_header(
                &mut response,
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}"),
            );
            insert_header(&mut response, header::CONTENT_LENGTH, length.to_string());
            Ok(response)
        }
    }
}

fn insert_header(response: &mut Response, name: header::HeaderName, value: String) {
    if let Ok(value) = value.parse() {
        response.headers_mut().insert(name, value);
    }
}
