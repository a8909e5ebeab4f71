//! Object store wrappers that slow down or break backend calls.

use async_trait::async_trait;
use bytes::Bytes;
use ferry_storage::error::{StorageError, StorageResult};
use ferry_storage::traits::{
    ByteStream, CompletedPart, ObjectMeta, ObjectStore, PresignedRequest,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The most recent [`FaultyStore`] a server built through [`faulty_wrapper`].
pub type FaultyHandle = Arc<Mutex<Option<Arc<FaultyStore>>>>;

/// A store wrapper for `TestServer::with_storage` that keeps a handle on the
/// store it builds, so a test can read its counters.
#[allow(dead_code)]
pub fn faulty_wrapper<F>(
    build: F,
) -> (
    impl Fn(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore> + Send + Sync + 'static,
    FaultyHandle,
)
where
    F: Fn(FaultyStore) -> FaultyStore + Send + Sync + 'static,
{
    let handle: FaultyHandle = Arc::new(Mutex::new(None));
    let built = handle.clone();
    let wrap = move |inner: Arc<dyn ObjectStore>| -> Arc<dyn ObjectStore> {
        let store = Arc::new(build(FaultyStore::new(inner)));
        *built.lock().unwrap() = Some(store.clone());
        store
    };
    (wrap, handle)
}

#[allow(dead_code)]
pub fn built_store(handle: &FaultyHandle) -> Arc<FaultyStore> {
    handle.lock().unwrap().clone().expect("server did not build a store")
}

/// Backend wrapper that injects delays and failures into backend calls.
/// Completions fail with a retryable error, so the retry layer sees them.
#[allow(dead_code)]
pub struct FaultyStore {
    inner: Arc<dyn ObjectStore>,
    part_delay: Duration,
    slow_parts: u32,
    fail_complete: bool,
    presign: bool,
    pub upload_part_calls: AtomicU32,
    pub complete_calls: AtomicU32,
    pub abort_calls: AtomicU32,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            part_delay: Duration::ZERO,
            slow_parts: 0,
            fail_complete: false,
            presign: false,
            upload_part_calls: AtomicU32::new(0),
            complete_calls: AtomicU32::new(0),
            abort_calls: AtomicU32::new(0),
        }
    }

    pub fn slow_parts(mut self, count: u32, delay: Duration) -> Self {
        self.slow_parts = count;
        self.part_delay = delay;
        self
    }

    pub fn failing_complete(mut self) -> Self {
        self.fail_complete = true;
        self
    }

    pub fn presigning(mut self) -> Self {
        self.presign = true;
        self
    }

    pub fn aborts(&self) -> u32 {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn completes(&self) -> u32 {
        self.complete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
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
        if self.upload_part_calls.fetch_add(1, Ordering::SeqCst) < self.slow_parts {
            tokio::time::sleep(self.part_delay).await;
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
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_complete {
            return Err(StorageError::S3(
                "injected transient failure in complete_multipart_upload".into(),
            ));
        }
        self.inner
            .complete_multipart_upload(key, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
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
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.inner.delete(key).await
    }

    async fn presign_put(&self, key: &str, expires_in: Duration) -> StorageResult<PresignedRequest> {
        if !self.presign {
            return self.inner.presign_put(key, expires_in).await;
        }
        Ok(PresignedRequest {
            method: "PUT".to_string(),
            url: format!("https://direct-upload.test/{key}"),
            expires_at: time::OffsetDateTime::now_utc() + expires_in,
        })
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}
