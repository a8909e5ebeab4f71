//! Core domain types and shared logic for the ferry upload engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload session identifiers and the session state machine
//! - Block-wise content fingerprints used for deduplication
//! - Size-based endpoint routing
//! - Retry policy applied to backend I/O
//! - Completion aggregation policy (single vs batch notifications)
//! - tus protocol header helpers

pub mod completion;
pub mod config;
pub mod error;
pub mod hash;
pub mod retry;
pub mod routing;
pub mod tus;
pub mod upload;

pub use completion::{BatchDecision, BatchWindow, CompletionOutcome, FileOutcome};
pub use error::{Error, Result};
pub use hash::{BlockHasher, ContentHash, ContentHasher};
pub use retry::RetryPolicy;
pub use routing::{EndpointClass, RouteDecision, Router};
pub use upload::{UploadId, UploadSession, UploadState};

/// Content fingerprint block size: 4 MiB
pub const HASH_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default backend part size: 8 MiB
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest part size S3-compatible backends accept for non-final parts: 5 MiB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum chunk size accepted in a single PATCH: 32 MiB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Default edge/direct routing threshold: 100 MiB
pub const DEFAULT_ROUTE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Default maximum upload size: 2 GiB
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 2 * 1024 * 1024 * 1024;
