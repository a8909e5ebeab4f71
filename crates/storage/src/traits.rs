//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;
use time::OffsetDateTime;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// A part accepted by the backend within a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: i32,
    /// Backend-assigned entity tag, required to complete the upload.
    pub etag: String,
    /// Part size in bytes.
    pub size: u64,
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
    /// Entity tag (if available).
    pub etag: Option<String>,
}

/// A pre-authorised request a client can issue directly against the backend.
#[derive(Clone, Debug)]
pub struct PresignedRequest {
    /// HTTP method the URL is signed for.
    pub method: String,
    /// Fully signed URL.
    pub url: String,
    /// When the signature stops being valid.
    pub expires_at: OffsetDateTime,
}

/// Object store abstraction modelled on the S3 multipart API.
///
/// Multipart uploads are assembled from independently uploaded parts and
/// become visible atomically on [`ObjectStore::complete_multipart_upload`].
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Open a multipart upload for `key` and return the backend upload id.
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String>;

    /// Upload one part. Part numbers start at 1.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart>;

    /// Assemble the listed parts, in order, into the final object.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Discard a multipart upload and every part uploaded to it.
    ///
    /// Returns `NotFound` when the upload is unknown (already completed or aborted).
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Put a small object atomically in one request.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Issue a presigned PUT URL for `key`.
    ///
    /// Backends without a network-reachable endpoint return `Unsupported`.
    async fn presign_put(&self, key: &str, expires_in: Duration) -> StorageResult<PresignedRequest> {
        let _ = expires_in;
        Err(StorageError::Unsupported(format!(
            "{} backend cannot presign '{key}'",
            self.backend_name()
        )))
    }

    /// Get the name of this storage backend (e.g., "s3", "filesystem").
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification (e.g., local filesystem).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
