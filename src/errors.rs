use crate::services::error::StorageError;
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl AppError {
    /// 503 for failures worth retrying as-is.
    ///
    /// Upload streams fail with the multipart decoder's own error (body too
    /// large, malformed part); that status is kept instead.
    fn unavailable(err: StorageError) -> Self {
        if let StorageError::BlobWriteFailed(io) = &err {
            if let Some(multipart) = io
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<MultipartError>())
            {
                return Self::new(multipart.status(), multipart.body_text());
            }
        }
        Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        if err.is_retryable() {
            return Self::unavailable(err);
        }
        let status = match &err {
            StorageError::BucketNotFound(_)
            | StorageError::ObjectNotFound { .. }
            | StorageError::BlobNotFound(_) => StatusCode::NOT_FOUND,
            StorageError::ObjectAlreadyExists { .. } => StatusCode::CONFLICT,
            StorageError::InvalidBucketName { .. } | StorageError::InvalidObjectKey => {
                StatusCode::BAD_REQUEST
            }
            StorageError::BlobWriteFailed(_)
            | StorageError::IndexInconsistent { .. }
            | StorageError::Catalog(_)
            | StorageError::Io(_) => {
                error!(error = %err, "storage failure");
                return Self::internal(err.to_string());
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        Self::new(err.status(), err.body_text())
    }
}
