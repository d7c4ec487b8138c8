//! Error types for the HTTP layer.

use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lodestore_store::StoreError;
use serde_json::json;

/// Alias for `Result<T, WebError>`.
pub type WebResult<T> = Result<T, WebError>;

/// Failures of the HTTP listener itself.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    /// The listener could not be bound.
    #[error("failed to bind http listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The serve loop stopped with an I/O error.
    #[error("http server failed: {0}")]
    Serve(#[from] std::io::Error),

    /// In-flight requests did not drain before the deadline.
    #[error("http shutdown exceeded deadline of {deadline:?}")]
    ShutdownTimeout { deadline: Duration },

    /// The serve task was cancelled or panicked.
    #[error("http server task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for WebError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// A store failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            StoreError::KeyExists { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, %status, "request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
