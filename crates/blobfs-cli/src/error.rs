//! HTTP error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use blobfs_core::BlobError;
use thiserror::Error;

/// Errors returned by the file server
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Blob(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Blob(BlobError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Blob(BlobError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        // Internal details stay in the log
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
            _ => self.to_string(),
        };
        (status, [("Content-Type", "text/plain; charset=utf-8")], message).into_response()
    }
}
