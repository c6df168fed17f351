//! Error types shared by the library modules and the server binary.

use thiserror::Error;

/// Failure taxonomy for the backend. The HTTP layer maps variants onto
/// status codes: `Validation` becomes 400, `NotFound` 404, everything else
/// 500.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    /// yt-dlp exited non-zero or produced unusable output. The captured
    /// stderr travels along for diagnostics.
    #[error("{message}")]
    ExternalTool { message: String, stderr: String },

    #[error("{0} is not installed or not in PATH")]
    ToolNotFound(String),

    #[error("{0}")]
    NotFound(String),

    #[error("could not parse tool output: {0}")]
    OutputParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
