//! API error types.

use crate::sessions::SessionError;
use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use ferry_core::tus;
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("storage error: {0}")]
    Storage(#[from] ferry_storage::StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] ferry_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] ferry_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
            Self::Session(e) => match e {
                SessionError::NotFound(_) => "not_found",
                SessionError::Gone { .. } => "upload_gone",
                SessionError::NotWritable { .. } => "upload_not_writable",
                SessionError::NotAbortable { .. } => "upload_not_abortable",
                SessionError::OffsetMismatch { .. } => "offset_mismatch",
                SessionError::TooLarge { .. } => "upload_too_large",
                SessionError::ExceedsDeclaredSize { .. } => "exceeds_declared_size",
                SessionError::AdmissionTimeout { .. } => "admission_timeout",
                SessionError::Timeout { .. } => "chunk_timeout",
                SessionError::Backend { .. } => "backend_unavailable",
                SessionError::FinalizeFailed { .. } => "finalize_failed",
                SessionError::SpoolLost { .. } => "spool_lost",
                SessionError::Corrupt(_) => "corrupt_session",
                SessionError::Storage(_) => "storage_error",
                SessionError::Metadata(_) => "metadata_error",
                SessionError::Core(_) => "bad_request",
                SessionError::Io(_) => "io_error",
            },
            Self::Storage(_) => "storage_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Session(e) => match e {
                SessionError::NotFound(_) => StatusCode::NOT_FOUND,
                SessionError::Gone { .. } => StatusCode::GONE,
                SessionError::NotWritable { .. }
                | SessionError::NotAbortable { .. }
                | SessionError::OffsetMismatch { .. } => StatusCode::CONFLICT,
                SessionError::TooLarge { .. } | SessionError::ExceedsDeclaredSize { .. } => {
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                SessionError::AdmissionTimeout { .. } | SessionError::Backend { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                SessionError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
                SessionError::Core(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Storage(e) => match e {
                ferry_storage::StorageError::NotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Metadata(e) => match e {
                ferry_metadata::MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                ferry_metadata::MetadataError::AlreadyExists(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Session(SessionError::AdmissionTimeout { retry_after_secs }) => {
                Some(*retry_after_secs)
            }
            Self::Session(SessionError::Backend { .. }) | Self::Unavailable(_) => Some(1),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "Request failed");
        }

        let offset = match &self {
            Self::Session(e) => e.upload_offset(),
            _ => None,
        };
        let retry_after = self.retry_after();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            tus::HEADER_TUS_RESUMABLE,
            HeaderValue::from_static(tus::TUS_VERSION),
        );
        if let Some(offset) = offset {
            headers.insert(tus::HEADER_UPLOAD_OFFSET, HeaderValue::from(offset));
        }
        if let Some(secs) = retry_after {
            headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{UploadId, UploadState};

    #[test]
    fn test_offset_mismatch_is_conflict_with_offset_header() {
        let response = ApiError::from(SessionError::OffsetMismatch { current: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[tus::HEADER_UPLOAD_OFFSET], "42");
        assert_eq!(response.headers()[tus::HEADER_TUS_RESUMABLE], tus::TUS_VERSION);
    }

    #[test]
    fn test_admission_timeout_sets_retry_after() {
        let response = ApiError::from(SessionError::AdmissionTimeout {
            retry_after_secs: 7,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[axum::http::header::RETRY_AFTER], "7");
    }

    #[test]
    fn test_session_status_mapping() {
        let cases = [
            (SessionError::NotFound(UploadId::new()), StatusCode::NOT_FOUND),
            (
                SessionError::Gone {
                    state: UploadState::Expired,
                },
                StatusCode::GONE,
            ),
            (
                SessionError::TooLarge {
                    declared: 10,
                    max: 5,
                },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (SessionError::Timeout { offset: 0 }, StatusCode::REQUEST_TIMEOUT),
            (
                SessionError::FinalizeFailed {
                    offset: 9,
                    detail: "boom".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError::from(error).status_code(), expected);
        }
    }
}
