//! Retry wrapper applied to every backend call.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CompletedPart, ObjectMeta, ObjectStore, PresignedRequest};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

/// Wraps an [`ObjectStore`] and retries transient failures with exponential
/// backoff. Non-retryable errors (see [`StorageError::is_retryable`]) and
/// exhausted retries are returned to the caller unchanged.
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &Arc<dyn ObjectStore> {
        &self.inner
    }
}

#[async_trait]
impl ObjectStore for RetryingStore {
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        self.policy
            .run(
                "create_multipart_upload",
                move || self.inner.create_multipart_upload(key),
                StorageError::is_retryable,
            )
            .await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        self.policy
            .run(
                "upload_part",
                move || {
                    self.inner
                        .upload_part(key, upload_id, part_number, data.clone())
                },
                StorageError::is_retryable,
            )
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.policy
            .run(
                "complete_multipart_upload",
                move || self.inner.complete_multipart_upload(key, upload_id, parts),
                StorageError::is_retryable,
            )
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.policy
            .run(
                "abort_multipart_upload",
                move || self.inner.abort_multipart_upload(key, upload_id),
                StorageError::is_retryable,
            )
            .await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.policy
            .run("head", move || self.inner.head(key), StorageError::is_retryable)
            .await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.policy
            .run("get", move || self.inner.get(key), StorageError::is_retryable)
            .await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        // Only opening the stream is retried; a broken stream surfaces to the reader.
        self.policy
            .run(
                "get_stream",
                move || self.inner.get_stream(key),
                StorageError::is_retryable,
            )
            .await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.policy
            .run(
                "put",
                move || self.inner.put(key, data.clone()),
                StorageError::is_retryable,
            )
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.policy
            .run("delete", move || self.inner.delete(key), StorageError::is_retryable)
            .await
    }

    async fn presign_put(&self, key: &str, expires_in: Duration) -> StorageResult<PresignedRequest> {
        // Signing is local; nothing to retry.
        self.inner.presign_put(key, expires_in).await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await
    }
}
