use async_trait::async_trait;
use bytes::Bytes;
use ferry_storage::error::{StorageError, StorageResult};
use ferry_storage::traits::{ByteStream, CompletedPart, ObjectMeta, ObjectStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Kind of error a [`FlakyStore`] injects.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug)]
pub enum FailureKind {
    /// Connection reset style error (retryable).
    Transient,
    /// 403-style refusal (not retryable).
    Rejected,
}

impl FailureKind {
    fn error(self, op: &str) -> StorageError {
        match self {
            FailureKind::Transient => {
                StorageError::S3(format!("injected transient failure in {op}").into())
            }
            FailureKind::Rejected => StorageError::Rejected {
                status: 403,
                message: format!("injected rejection in {op}"),
            },
        }
    }
}

/// Backend wrapper that fails the first `failures` calls to each write
/// operation before delegating to the inner store.
#[allow(dead_code)]
pub struct FlakyStore {
    inner: Arc<dyn ObjectStore>,
    kind: FailureKind,
    failures: u32,
    pub upload_part_calls: AtomicU32,
    pub complete_calls: AtomicU32,
    pub put_calls: AtomicU32,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(inner: Arc<dyn ObjectStore>, kind: FailureKind, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            kind,
            failures,
            upload_part_calls: AtomicU32::new(0),
            complete_calls: AtomicU32::new(0),
            put_calls: AtomicU32::new(0),
        })
    }

    fn should_fail(&self, counter: &AtomicU32) -> bool {
        counter.fetch_add(1, Ordering::SeqCst) < self.failures
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        self.inner.create_multipart_upload(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        if self.should_fail(&self.upload_part_calls) {
            return Err(self.kind.error("upload_part"));
        }
        self.inner
            .upload_part(key, upload_id, part_number, data)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        if self.should_fail(&self.complete_calls) {
            return Err(self.kind.error("complete_multipart_upload"));
        }
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.inner.abort_multipart_upload(key, upload_id).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if self.should_fail(&self.put_calls) {
            return Err(self.kind.error("put"));
        }
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
