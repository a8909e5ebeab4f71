//! Configuration types shared across crates.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest Upload-Length accepted on session creation.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Largest PATCH body accepted in one request.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Per-chunk I/O timeout in seconds. Timeouts are reported as retryable.
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// Idle session lifetime in seconds, measured from the last accepted chunk.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Interval in seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Directory holding per-session spool files.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// When enabled, ensure this endpoint is network-restricted
    /// to authorized Prometheus scraper IPs only at the infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_upload_size() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_SIZE
}

fn default_max_chunk_size() -> u64 {
    crate::MAX_CHUNK_SIZE
}

fn default_chunk_timeout_secs() -> u64 {
    120
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("./data/spool")
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_size: default_max_upload_size(),
            max_chunk_size: default_max_chunk_size(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            spool_dir: default_spool_dir(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Get the session TTL as a Duration.
    pub fn session_ttl(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Get the chunk timeout as a std::time::Duration.
    pub fn chunk_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Get the sweep interval, never zero.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Endpoint routing configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Sizes at or below this many bytes use the edge path.
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: u64,
    /// Public base URL of the edge path (e.g. "https://uploads.example.com").
    #[serde(default)]
    pub edge_base_url: Option<String>,
    /// Public base URL of the direct path, bypassing the edge proxy.
    #[serde(default)]
    pub direct_base_url: Option<String>,
    /// Lifetime of presigned direct-upload URLs in seconds.
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,
}

fn default_threshold_bytes() -> u64 {
    crate::DEFAULT_ROUTE_THRESHOLD
}

fn default_presign_expiry_secs() -> u64 {
    3600 // 1 hour
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_threshold_bytes(),
            edge_base_url: None,
            direct_base_url: None,
            presign_expiry_secs: default_presign_expiry_secs(),
        }
    }
}

impl RouterConfig {
    pub fn router(&self) -> crate::Router {
        crate::Router::new(self.threshold_bytes)
    }

    pub fn presign_expiry(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.presign_expiry_secs)
    }
}

/// Admission control for large-file sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Large-file sessions allowed to write to the backend concurrently.
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
    /// How long a chunk write waits for a free slot before a retryable 503.
    #[serde(default = "default_admission_wait_ms")]
    pub wait_timeout_ms: u64,
    /// A session that sends no chunk for this long gives its slot back.
    #[serde(default = "default_admission_idle_release_ms")]
    pub idle_release_ms: u64,
}

fn default_max_active_sessions() -> usize {
    1
}

fn default_admission_wait_ms() -> u64 {
    5000
}

fn default_admission_idle_release_ms() -> u64 {
    300_000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: default_max_active_sessions(),
            wait_timeout_ms: default_admission_wait_ms(),
            idle_release_ms: default_admission_idle_release_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn idle_release(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_release_ms)
    }
}

/// Backend multipart upload configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultipartConfig {
    /// Size of every backend part except the last.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
}

fn default_part_size() -> u64 {
    crate::DEFAULT_PART_SIZE
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
        }
    }
}

impl MultipartConfig {
    /// Part boundaries must line up with fingerprint blocks so each part's
    /// block digests can be persisted alongside it.
    pub fn validate(&self) -> Result<(), String> {
        if self.part_size < crate::MIN_PART_SIZE {
            return Err(format!(
                "multipart.part_size {} is below the backend minimum of {} bytes",
                self.part_size,
                crate::MIN_PART_SIZE
            ));
        }
        if self.part_size % crate::HASH_BLOCK_SIZE != 0 {
            return Err(format!(
                "multipart.part_size {} must be a multiple of {} bytes",
                self.part_size,
                crate::HASH_BLOCK_SIZE
            ));
        }
        Ok(())
    }
}

/// Retry configuration for backend I/O.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single retry delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter fraction in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            std::time::Duration::from_millis(self.base_delay_ms),
            std::time::Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("retry.jitter {} must be within [0, 1]", self.jitter));
        }
        Ok(())
    }
}

/// Completion notification configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Completions in one window at or above this count are sent as one batch.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,
    /// Discord-compatible webhook URL. When unset, notifications are only logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Webhook request timeout in seconds.
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    /// Pending notifications buffered before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Trailing window for automatic aggregation of finalized sessions.
    /// Disabled when unset; clients then drive aggregation via complete-batch.
    #[serde(default)]
    pub auto_window_ms: Option<u64>,
}

fn default_batch_threshold() -> usize {
    crate::completion::DEFAULT_BATCH_THRESHOLD
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            batch_threshold: default_batch_threshold(),
            webhook_url: None,
            timeout_secs: default_webhook_timeout_secs(),
            queue_capacity: default_queue_capacity(),
            auto_window_ms: None,
        }
    }
}

impl NotificationConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// Public endpoint used when presigning direct-upload URLs.
        /// Falls back to `endpoint` when unset.
        #[serde(default)]
        public_endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            _ => Ok(()),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single-node deployments and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer FERRY_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds (prevents hung queries).
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(30000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60) // advisory only
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                (None, None, _) => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
                (None, Some(_), None) => Err(
                    "postgres config requires 'database' when using individual fields".to_string(),
                ),
            },
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Endpoint routing configuration.
    #[serde(default)]
    pub router: RouterConfig,
    /// Large-file admission control.
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Backend multipart configuration.
    #[serde(default)]
    pub multipart: MultipartConfig,
    /// Retry policy for backend I/O.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Completion notifications.
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses filesystem storage and SQLite metadata,
    /// with a short retry policy so failure paths finish quickly.
    pub fn for_testing() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 10,
                jitter: 0.0,
            },
            ..Self::default()
        }
    }

    /// Validate every section. Returns warnings for settings that are
    /// allowed but likely unintended, and an error for unusable settings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        self.storage.validate()?;
        self.metadata.validate()?;
        self.multipart.validate()?;
        self.retry.validate()?;

        if self.admission.max_active_sessions == 0 {
            return Err("admission.max_active_sessions must be at least 1".to_string());
        }
        if self.admission.idle_release_ms == 0 {
            return Err("admission.idle_release_ms must be at least 1".to_string());
        }
        if self.server.max_chunk_size == 0 {
            return Err("server.max_chunk_size must be at least 1".to_string());
        }
        if self.server.session_ttl_secs == 0 {
            return Err("server.session_ttl_secs must be at least 1".to_string());
        }
        if self.router.threshold_bytes == 0 {
            return Err("router.threshold_bytes must be at least 1".to_string());
        }
        if self.notifications.queue_capacity == 0 {
            return Err("notifications.queue_capacity must be at least 1".to_string());
        }

        if self.notifications.batch_threshold < 2 {
            warnings.push(format!(
                "notifications.batch_threshold={} is below 2; single completions are never \
                 reported as a batch, so 2 is used",
                self.notifications.batch_threshold
            ));
        }
        if self.admission.idle_release() < self.server.chunk_timeout() {
            warnings.push(format!(
                "admission.idle_release_ms={} is below the chunk timeout; a slow chunk can \
                 lose its session's admission slot",
                self.admission.idle_release_ms
            ));
        }
        if self.server.max_upload_size <= self.router.threshold_bytes {
            warnings.push(
                "server.max_upload_size is not above router.threshold_bytes; \
                 the direct path will never be chosen for accepted uploads"
                    .to_string(),
            );
        }
        if self.router.direct_base_url.is_none() {
            warnings.push(
                "router.direct_base_url is unset; route responses will return \
                 relative upload URLs for the direct path"
                    .to_string(),
            );
        }

        Ok(warnings)
    }
}
