//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid size: {0} (must be greater than zero)")]
    InvalidSize(i64),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid upload id: {0}")]
    InvalidUploadId(String),

    #[error("invalid upload state: {0}")]
    InvalidState(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid upload metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
