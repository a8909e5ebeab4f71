//! Server test utilities.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use ferry_core::config::{AppConfig, MetadataConfig, StorageConfig};
use ferry_core::tus;
use ferry_metadata::{MetadataStore, SqliteStore};
use ferry_server::notify::Notifier;
use ferry_server::{AppState, create_router};
use ferry_storage::{FilesystemBackend, ObjectStore};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

/// Wraps the filesystem backend before the server sees it.
pub type StoreWrapper = Arc<dyn Fn(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore> + Send + Sync>;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    config: AppConfig,
    temp_dir: Arc<TempDir>,
    wrap: Option<StoreWrapper>,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, None, None).await
    }

    /// Create a test server that delivers notifications to `notifier`.
    pub async fn with_notifier<F>(modifier: F, notifier: Arc<dyn Notifier>) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        Self::build(modifier, Some(notifier), None).await
    }

    /// Create a test server whose object store is wrapped by `wrap`, before
    /// the retry layer. The wrapper is applied again on restart.
    pub async fn with_storage<F, W>(modifier: F, wrap: W) -> Self
    where
        F: FnOnce(&mut AppConfig),
        W: Fn(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore> + Send + Sync + 'static,
    {
        Self::build(modifier, None, Some(Arc::new(wrap))).await
    }

    async fn build<F>(
        modifier: F,
        notifier: Option<Arc<dyn Notifier>>,
        wrap: Option<StoreWrapper>,
    ) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = Arc::new(tempfile::tempdir().expect("Failed to create temp directory"));
        let root = temp_dir.path().to_path_buf();

        let mut config = AppConfig::for_testing();
        config.server.spool_dir = root.join("spool");
        config.storage = StorageConfig::Filesystem {
            path: root.join("storage"),
        };
        config.metadata = MetadataConfig::Sqlite {
            path: root.join("metadata.db"),
            query_timeout_secs: None,
        };
        modifier(&mut config);

        Self::start(config, temp_dir, notifier, wrap).await
    }

    async fn start(
        config: AppConfig,
        temp_dir: Arc<TempDir>,
        notifier: Option<Arc<dyn Notifier>>,
        wrap: Option<StoreWrapper>,
    ) -> Self {
        let storage_path = match &config.storage {
            StorageConfig::Filesystem { path } => path.clone(),
            other => panic!("test server needs filesystem storage, got {other:?}"),
        };
        let db_path = match &config.metadata {
            MetadataConfig::Sqlite { path, .. } => path.clone(),
            other => panic!("test server needs sqlite metadata, got {other:?}"),
        };

        let storage: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(&storage_path)
                .await
                .expect("Failed to create storage backend"),
        );
        let storage = match &wrap {
            Some(wrap) => wrap(storage),
            None => storage,
        };
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let state = match notifier {
            Some(notifier) => AppState::with_notifier(config.clone(), storage, metadata, notifier),
            None => AppState::new(config.clone(), storage, metadata),
        };
        let router = create_router(state.clone());

        Self {
            router,
            state,
            config,
            temp_dir,
            wrap,
        }
    }

    /// Start a fresh server over the same storage, metadata and spool,
    /// as a process restart would.
    pub async fn restart(&self) -> Self {
        Self::start(
            self.config.clone(),
            self.temp_dir.clone(),
            None,
            self.wrap.clone(),
        )
        .await
    }

    pub fn root(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    pub fn storage(&self) -> Arc<dyn ObjectStore> {
        self.state.storage.clone()
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        self.state.metadata.clone()
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Send a JSON request and decode the JSON response (Null when empty).
    pub async fn json_request(
        &self,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };
        let response = self.send(builder.body(body).unwrap()).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// POST /uploads. Returns the response; `Location` holds the session URL.
    pub async fn create_upload(&self, filename: &str, size: u64) -> Response {
        let metadata = tus::encode_metadata(&BTreeMap::from([(
            "filename".to_string(),
            filename.to_string(),
        )]));
        let request = Request::builder()
            .method(Method::POST)
            .uri("/uploads")
            .header(tus::HEADER_TUS_RESUMABLE, tus::TUS_VERSION)
            .header(tus::HEADER_UPLOAD_LENGTH, size.to_string())
            .header(tus::HEADER_UPLOAD_METADATA, metadata)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Create a session and return its location, asserting success.
    pub async fn create_session(&self, filename: &str, size: u64) -> String {
        let response = self.create_upload(filename, size).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response.headers()["location"].to_str().unwrap().to_string()
    }

    /// PATCH a chunk at `offset`.
    pub async fn patch(&self, location: &str, offset: u64, data: Bytes) -> Response {
        let request = Request::builder()
            .method(Method::PATCH)
            .uri(location)
            .header(tus::HEADER_TUS_RESUMABLE, tus::TUS_VERSION)
            .header("content-type", tus::OFFSET_OCTET_STREAM)
            .header(tus::HEADER_UPLOAD_OFFSET, offset.to_string())
            .header("content-length", data.len().to_string())
            .body(Body::from(data))
            .unwrap();
        self.send(request).await
    }

    pub async fn head(&self, location: &str) -> Response {
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(location)
            .header(tus::HEADER_TUS_RESUMABLE, tus::TUS_VERSION)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn delete(&self, location: &str) -> Response {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(location)
            .header(tus::HEADER_TUS_RESUMABLE, tus::TUS_VERSION)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    /// Send every chunk in order and return the last response.
    pub async fn upload_chunks(&self, location: &str, data: &Bytes, chunk_size: usize) -> Response {
        let mut offset = 0u64;
        let mut last = None;
        for chunk in super::chunks(data, chunk_size) {
            let len = chunk.len() as u64;
            let response = self.patch(location, offset, chunk).await;
            assert_eq!(
                response.status(),
                StatusCode::NO_CONTENT,
                "chunk at offset {offset} rejected"
            );
            offset += len;
            assert_eq!(upload_offset(&response), offset);
            last = Some(response);
        }
        last.expect("no chunks sent")
    }

    /// Create a session and upload `data` completely.
    pub async fn upload_file(&self, filename: &str, data: &Bytes, chunk_size: usize) -> (String, Response) {
        let location = self.create_session(filename, data.len() as u64).await;
        let response = self.upload_chunks(&location, data, chunk_size).await;
        (location, response)
    }

    /// GET /uploads/{id} as JSON.
    pub async fn status(&self, location: &str) -> serde_json::Value {
        let (status, json) = self.json_request(Method::GET, location, None).await;
        assert_eq!(status, StatusCode::OK);
        json
    }
}

/// Parse the `Upload-Offset` response header.
#[allow(dead_code)]
pub fn upload_offset(response: &Response) -> u64 {
    response.headers()[tus::HEADER_UPLOAD_OFFSET]
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}

/// Read the `Upload-State` response header.
#[allow(dead_code)]
pub fn upload_state(response: &Response) -> String {
    response.headers()[tus::HEADER_UPLOAD_STATE]
        .to_str()
        .unwrap()
        .to_string()
}
