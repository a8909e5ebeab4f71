//! Session manager errors.

use ferry_core::{UploadId, UploadState};
use ferry_metadata::MetadataError;
use ferry_storage::StorageError;

/// Errors raised by the upload session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("upload session not found: {0}")]
    NotFound(UploadId),

    #[error("upload session is {state}")]
    Gone { state: UploadState },

    #[error("upload session is {state} and accepts no more data")]
    NotWritable { state: UploadState, offset: u64 },

    #[error("upload session is {state} and cannot be aborted")]
    NotAbortable { state: UploadState },

    #[error("offset mismatch: session is at offset {current}")]
    OffsetMismatch { current: u64 },

    #[error("declared size {declared} exceeds the {max} byte upload limit")]
    TooLarge { declared: u64, max: u64 },

    #[error("chunk of {len} bytes at offset {offset} exceeds the declared size {declared}")]
    ExceedsDeclaredSize { offset: u64, len: u64, declared: u64 },

    #[error("no upload slot became free; retry in {retry_after_secs}s")]
    AdmissionTimeout { retry_after_secs: u64 },

    #[error("chunk I/O timed out")]
    Timeout { offset: u64 },

    #[error("storage backend unavailable: {source}")]
    Backend { offset: u64, source: StorageError },

    #[error("finalization failed: {detail}")]
    FinalizeFailed { offset: u64, detail: String },

    #[error("spool for upload {id} is missing data: {detail}")]
    SpoolLost { id: UploadId, detail: String },

    #[error("inconsistent session state: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] ferry_core::Error),

    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// The authoritative offset a client should resume from, when known.
    pub fn upload_offset(&self) -> Option<u64> {
        match self {
            Self::NotWritable { offset, .. }
            | Self::Timeout { offset }
            | Self::Backend { offset, .. }
            | Self::FinalizeFailed { offset, .. } => Some(*offset),
            Self::OffsetMismatch { current } => Some(*current),
            _ => None,
        }
    }

    /// Attach an offset to a backend failure so the client can resume.
    pub(crate) fn at_offset(self, offset: u64) -> Self {
        match self {
            Self::Storage(source) if source.is_retryable() => Self::Backend { offset, source },
            other => other,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
