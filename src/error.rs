// ABOUTME: Request-level error type for the conversion endpoints
// ABOUTME: Maps each failure class to an HTTP status and a JSON detail body

use crate::storage::StorageError;
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, ConversionError>;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{0}")]
    BadRequest(String),
    #[error("File not found in storage: {0}")]
    SourceNotFound(String),
    #[error("{0}")]
    UnsupportedMedia(String),
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    #[error("Conversion failed: {0}")]
    Transcode(String),
    #[error("Storage error: {0}")]
    Storage(StorageError),
    #[error("Multipart error: {0}")]
    Multipart(#[from] MultipartError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl ConversionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ConversionError::BadRequest(_) | ConversionError::SourceNotFound(_) => {
                StatusCode::BAD_REQUEST
            }
            ConversionError::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ConversionError::InvalidImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ConversionError::Storage(_) => StatusCode::BAD_GATEWAY,
            // Covers body-limit rejections (413) as well as malformed bodies (400)
            ConversionError::Multipart(e) => e.status(),
            ConversionError::Transcode(_)
            | ConversionError::Io(_)
            | ConversionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ConversionError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(path) => ConversionError::SourceNotFound(path),
            StorageError::InvalidPath(msg) => ConversionError::BadRequest(msg),
            other => ConversionError::Storage(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ConversionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = %status, "Conversion error: {}", self);
        } else {
            tracing::warn!(status = %status, "Rejected request: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ConversionError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ConversionError::SourceNotFound("a/b.wav".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ConversionError::UnsupportedMedia("x".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ConversionError::InvalidImage("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ConversionError::Transcode("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ConversionError::Storage(StorageError::Request("x".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_storage_not_found_becomes_source_not_found() {
        let err: ConversionError = StorageError::NotFound("songs/a.wav".into()).into();
        assert!(matches!(err, ConversionError::SourceNotFound(_)));
        assert_eq!(err.to_string(), "File not found in storage: songs/a.wav");

        let err: ConversionError = StorageError::InvalidPath("bad path".into()).into();
        assert!(matches!(err, ConversionError::BadRequest(_)));
    }
}
