use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the orchestration library itself.
#[derive(Debug, Error)]
pub enum Error {
    /// A configured tool path does not point at an existing file.
    #[error("file not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("failed to start {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process was killed because the orchestrator is shutting down.
    #[error("process cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

// Errors returned by the HTTP handlers.
pub enum AppError {
    Internal(anyhow::Error),
    YtDlp(String),
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(e) => {
                tracing::error!("Internal server error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
            AppError::YtDlp(e) => (StatusCode::BAD_GATEWAY, format!("yt-dlp error: {}", e)),
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            AppError::NotFound(e) => (StatusCode::NOT_FOUND, e),
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}

// Lets handlers use `?` on anything convertible into `anyhow::Error`,
// including the library `Error` above.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
