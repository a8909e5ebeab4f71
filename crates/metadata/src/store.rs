//! Metadata store trait and implementations.

use crate::error::MetadataResult;
use crate::repos::{DedupRepo, DirectUploadRepo, NotificationRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    UploadRepo + DedupRepo + DirectUploadRepo + NotificationRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(30);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(query_timeout_secs.max(1)));

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers and avoids "database is locked"
            // failures under concurrent axum handlers.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "SQLite metadata store ready");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_sessions (
                    upload_id, filename, declared_size, received_offset, state,
                    object_key, backend_upload_id, content_hash, metadata_json, error_detail,
                    created_at, last_activity_at, expires_at, finished_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(session.upload_id)
            .bind(&session.filename)
            .bind(session.declared_size)
            .bind(session.received_offset)
            .bind(&session.state)
            .bind(&session.object_key)
            .bind(&session.backend_upload_id)
            .bind(&session.content_hash)
            .bind(&session.metadata_json)
            .bind(&session.error_detail)
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .bind(session.expires_at)
            .bind(session.finished_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE upload_id = ?",
            )
            .bind(upload_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_latest_session_by_filename(
            &self,
            filename: &str,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE filename = ? ORDER BY created_at DESC LIMIT 1",
            )
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_latest_successful_session_by_filename(
            &self,
            filename: &str,
        ) -> MetadataResult<Option<UploadSessionRow>> {
            let row = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE filename = ? AND state IN ('completed', 'duplicate') \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn begin_receiving(
            &self,
            upload_id: Uuid,
            backend_upload_id: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET state = 'receiving', backend_upload_id = ?, last_activity_at = ? \
                 WHERE upload_id = ? AND state = 'created'",
            )
            .bind(backend_upload_id)
            .bind(at)
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn advance_offset(
            &self,
            upload_id: Uuid,
            expected_offset: i64,
            new_offset: i64,
            last_activity_at: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET received_offset = ?, \
                 state = CASE WHEN ? = declared_size THEN 'finalizing' ELSE state END, \
                 last_activity_at = ?, expires_at = ? \
                 WHERE upload_id = ? AND received_offset = ? AND state IN ('created', 'receiving')",
            )
            .bind(new_offset)
            .bind(new_offset)
            .bind(last_activity_at)
            .bind(expires_at)
            .bind(upload_id)
            .bind(expected_offset)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn transition_state(
            &self,
            upload_id: Uuid,
            from: &str,
            to: &str,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE upload_sessions SET state = ?, last_activity_at = ? WHERE upload_id = ? AND state = ?",
            )
            .bind(to)
            .bind(at)
            .bind(upload_id)
            .bind(from)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn finish_session(
            &self,
            upload_id: Uuid,
            from: &[&str],
            finish: &SessionFinish,
        ) -> MetadataResult<bool> {
            if from.is_empty() {
                return Ok(false);
            }
            let sql = format!(
                "UPDATE upload_sessions SET state = ?, object_key = ?, content_hash = COALESCE(?, content_hash), \
                 error_detail = ?, finished_at = ?, last_activity_at = ? \
                 WHERE upload_id = ? AND state IN ({})",
                placeholders(from.len())
            );
            let mut query = sqlx::query(&sql)
                .bind(finish.state.as_str())
                .bind(&finish.object_key)
                .bind(&finish.content_hash)
                .bind(&finish.error_detail)
                .bind(finish.finished_at)
                .bind(finish.finished_at)
                .bind(upload_id);
            for state in from {
                query = query.bind(*state);
            }
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_stalled_sessions(
            &self,
            before: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions \
                 WHERE (state = 'finalizing' OR (state = 'receiving' AND received_offset = declared_size)) \
                 AND last_activity_at < ? ORDER BY last_activity_at ASC LIMIT ?",
            )
            .bind(before)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn get_expired_sessions(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<UploadSessionRow>> {
            let rows = sqlx::query_as::<_, UploadSessionRow>(
                "SELECT * FROM upload_sessions WHERE state IN ('created', 'receiving') AND expires_at < ? \
                 ORDER BY expires_at ASC LIMIT ?",
            )
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn count_sessions_by_state(&self) -> MetadataResult<Vec<StateCountRow>> {
            let rows = sqlx::query_as::<_, StateCountRow>(
                "SELECT state, COUNT(*) AS count FROM upload_sessions GROUP BY state ORDER BY state",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn put_part(&self, part: &UploadPartRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO upload_parts (upload_id, part_number, etag, size_bytes, block_digests, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(upload_id, part_number) DO UPDATE SET
                    etag = excluded.etag,
                    size_bytes = excluded.size_bytes,
                    block_digests = excluded.block_digests,
                    created_at = excluded.created_at
                "#,
            )
            .bind(part.upload_id)
            .bind(part.part_number)
            .bind(&part.etag)
            .bind(part.size_bytes)
            .bind(&part.block_digests)
            .bind(part.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_parts(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadPartRow>> {
            let rows = sqlx::query_as::<_, UploadPartRow>(
                "SELECT * FROM upload_parts WHERE upload_id = ? ORDER BY part_number ASC",
            )
            .bind(upload_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_parts(&self, upload_id: Uuid) -> MetadataResult<()> {
            sqlx::query("DELETE FROM upload_parts WHERE upload_id = ?")
                .bind(upload_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl DedupRepo for SqliteStore {
        async fn get_dedup_record(
            &self,
            content_hash: &str,
        ) -> MetadataResult<Option<DedupRecordRow>> {
            let row = sqlx::query_as::<_, DedupRecordRow>(
                "SELECT * FROM dedup_records WHERE content_hash = ?",
            )
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn insert_dedup_if_absent(
            &self,
            record: &DedupRecordRow,
        ) -> MetadataResult<DedupRecordRow> {
            sqlx::query(
                r#"
                INSERT INTO dedup_records (content_hash, object_key, size_bytes, first_upload_id, first_seen_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(content_hash) DO NOTHING
                "#,
            )
            .bind(&record.content_hash)
            .bind(&record.object_key)
            .bind(record.size_bytes)
            .bind(record.first_upload_id)
            .bind(record.first_seen_at)
            .execute(&self.pool)
            .await?;

            let stored = sqlx::query_as::<_, DedupRecordRow>(
                "SELECT * FROM dedup_records WHERE content_hash = ?",
            )
            .bind(&record.content_hash)
            .fetch_one(&self.pool)
            .await?;
            Ok(stored)
        }

        async fn count_dedup_records(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dedup_records")
                .fetch_one(&self.pool)
                .await?;
            Ok(count.max(0) as u64)
        }
    }

    #[async_trait]
    impl DirectUploadRepo for SqliteStore {
        async fn record_direct_upload(&self, upload: &DirectUploadRow) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO direct_uploads (object_key, filename, declared_size, created_at, expires_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&upload.object_key)
            .bind(&upload.filename)
            .bind(upload.declared_size)
            .bind(upload.created_at)
            .bind(upload.expires_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_latest_direct_upload_by_filename(
            &self,
            filename: &str,
        ) -> MetadataResult<Option<DirectUploadRow>> {
            let row = sqlx::query_as::<_, DirectUploadRow>(
                "SELECT * FROM direct_uploads WHERE filename = ? ORDER BY created_at DESC LIMIT 1",
            )
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl NotificationRepo for SqliteStore {
        async fn load_or_create_notification_state(
            &self,
            now: OffsetDateTime,
        ) -> MetadataResult<NotificationStateRow> {
            sqlx::query(
                "INSERT OR IGNORE INTO notification_state (id, last_message_id, notifications_sent, updated_at) \
                 VALUES (1, NULL, 0, ?)",
            )
            .bind(now)
            .execute(&self.pool)
            .await?;

            let row = sqlx::query_as::<_, NotificationStateRow>(
                "SELECT last_message_id, notifications_sent, updated_at FROM notification_state WHERE id = 1",
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn save_notification_state(
            &self,
            state: &NotificationStateRow,
        ) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO notification_state (id, last_message_id, notifications_sent, updated_at)
                VALUES (1, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    last_message_id = excluded.last_message_id,
                    notifications_sent = excluded.notifications_sent,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&state.last_message_id)
            .bind(state.notifications_sent)
            .bind(state.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Upload sessions
CREATE TABLE IF NOT EXISTS upload_sessions (
    upload_id BLOB PRIMARY KEY,
    filename TEXT NOT NULL,
    declared_size INTEGER NOT NULL CHECK (declared_size > 0),
    received_offset INTEGER NOT NULL DEFAULT 0 CHECK (received_offset >= 0 AND received_offset <= declared_size),
    state TEXT NOT NULL DEFAULT 'created',
    object_key TEXT NOT NULL,
    backend_upload_id TEXT,
    content_hash TEXT,
    metadata_json TEXT,
    error_detail TEXT,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_state ON upload_sessions(state, expires_at);
CREATE INDEX IF NOT EXISTS idx_upload_sessions_filename ON upload_sessions(filename, created_at);

-- Backend parts already uploaded, with the fingerprint blocks they cover
CREATE TABLE IF NOT EXISTS upload_parts (
    upload_id BLOB NOT NULL,
    part_number INTEGER NOT NULL,
    etag TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    block_digests TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (upload_id, part_number),
    FOREIGN KEY (upload_id) REFERENCES upload_sessions(upload_id) ON DELETE CASCADE
);

-- Content hash index
CREATE TABLE IF NOT EXISTS dedup_records (
    content_hash TEXT PRIMARY KEY,
    object_key TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    first_upload_id BLOB NOT NULL,
    first_seen_at TEXT NOT NULL
);

-- Presigned targets issued for the direct path
CREATE TABLE IF NOT EXISTS direct_uploads (
    object_key TEXT PRIMARY KEY,
    filename TEXT NOT NULL,
    declared_size INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_direct_uploads_filename ON direct_uploads(filename, created_at);

-- Notification bookkeeping (singleton row)
CREATE TABLE IF NOT EXISTS notification_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    last_message_id TEXT,
    notifications_sent INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;
