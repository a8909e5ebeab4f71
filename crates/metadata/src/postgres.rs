//! PostgreSQL-based metadata store implementation.

use crate::error::MetadataResult;
use crate::models::*;
use crate::repos::{DedupRepo, DirectUploadRepo, NotificationRepo, UploadRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use ferry_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// Lets the password come from its own env var instead of a URL.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
            tracing::info!(timeout_ms, "PostgreSQL statement_timeout configured");
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UploadRepo for PostgresStore {
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                upload_id, filename, declared_size, received_offset, state,
                object_key, backend_upload_id, content_hash, metadata_json, error_detail,
                created_at, last_activity_at, expires_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
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
            "SELECT * FROM upload_sessions WHERE upload_id = $1",
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
            "SELECT * FROM upload_sessions WHERE filename = $1 ORDER BY created_at DESC LIMIT 1",
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
            "SELECT * FROM upload_sessions WHERE filename = $1 AND state IN ('completed', 'duplicate') \
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
            "UPDATE upload_sessions SET state = 'receiving', backend_upload_id = $1, last_activity_at = $2 \
             WHERE upload_id = $3 AND state = 'created'",
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
            "UPDATE upload_sessions SET received_offset = $1, \
             state = CASE WHEN $1 = declared_size THEN 'finalizing' ELSE state END, \
             last_activity_at = $2, expires_at = $3 \
             WHERE upload_id = $4 AND received_offset = $5 AND state IN ('created', 'receiving')",
        )
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
            "UPDATE upload_sessions SET state = $1, last_activity_at = $2 WHERE upload_id = $3 AND state = $4",
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
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            "UPDATE upload_sessions SET state = $1, object_key = $2, content_hash = COALESCE($3, content_hash), \
             error_detail = $4, finished_at = $5, last_activity_at = $5 \
             WHERE upload_id = $6 AND state = ANY($7)",
        )
        .bind(finish.state.as_str())
        .bind(&finish.object_key)
        .bind(&finish.content_hash)
        .bind(&finish.error_detail)
        .bind(finish.finished_at)
        .bind(upload_id)
        .bind(&from)
        .execute(&self.pool)
        .await?;
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
             AND last_activity_at < $1 ORDER BY last_activity_at ASC LIMIT $2",
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
            "SELECT * FROM upload_sessions WHERE state IN ('created', 'receiving') AND expires_at < $1 \
             ORDER BY expires_at ASC LIMIT $2",
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
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (upload_id, part_number) DO UPDATE SET
                etag = EXCLUDED.etag,
                size_bytes = EXCLUDED.size_bytes,
                block_digests = EXCLUDED.block_digests,
                created_at = EXCLUDED.created_at
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
            "SELECT * FROM upload_parts WHERE upload_id = $1 ORDER BY part_number ASC",
        )
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_parts(&self, upload_id: Uuid) -> MetadataResult<()> {
        sqlx::query("DELETE FROM upload_parts WHERE upload_id = $1")
            .bind(upload_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DedupRepo for PostgresStore {
    async fn get_dedup_record(&self, content_hash: &str) -> MetadataResult<Option<DedupRecordRow>> {
        let row =
            sqlx::query_as::<_, DedupRecordRow>("SELECT * FROM dedup_records WHERE content_hash = $1")
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
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (content_hash) DO NOTHING
            "#,
        )
        .bind(&record.content_hash)
        .bind(&record.object_key)
        .bind(record.size_bytes)
        .bind(record.first_upload_id)
        .bind(record.first_seen_at)
        .execute(&self.pool)
        .await?;

        let stored =
            sqlx::query_as::<_, DedupRecordRow>("SELECT * FROM dedup_records WHERE content_hash = $1")
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
impl DirectUploadRepo for PostgresStore {
    async fn record_direct_upload(&self, upload: &DirectUploadRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO direct_uploads (object_key, filename, declared_size, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5)",
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
            "SELECT * FROM direct_uploads WHERE filename = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl NotificationRepo for PostgresStore {
    async fn load_or_create_notification_state(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<NotificationStateRow> {
        sqlx::query(
            "INSERT INTO notification_state (id, last_message_id, notifications_sent, updated_at) \
             VALUES (1, NULL, 0, $1) ON CONFLICT (id) DO NOTHING",
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

    async fn save_notification_state(&self, state: &NotificationStateRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_state (id, last_message_id, notifications_sent, updated_at)
            VALUES (1, $1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET
                last_message_id = EXCLUDED.last_message_id,
                notifications_sent = EXCLUDED.notifications_sent,
                updated_at = EXCLUDED.updated_at
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
