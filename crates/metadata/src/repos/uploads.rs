//! Upload session and part repository.

use crate::error::MetadataResult;
use crate::models::{SessionFinish, StateCountRow, UploadPartRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload session operations.
///
/// State-changing methods are compare-and-set: they only apply when the row
/// is still in the expected state (or at the expected offset) and report
/// whether a row was updated.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create a new upload session.
    async fn create_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get an upload session by ID.
    async fn get_session(&self, upload_id: Uuid) -> MetadataResult<Option<UploadSessionRow>>;

    /// Most recently created session for a filename.
    async fn get_latest_session_by_filename(
        &self,
        filename: &str,
    ) -> MetadataResult<Option<UploadSessionRow>>;

    /// Most recently created `completed` or `duplicate` session for a filename.
    async fn get_latest_successful_session_by_filename(
        &self,
        filename: &str,
    ) -> MetadataResult<Option<UploadSessionRow>>;

    /// Record the backend multipart handle and move `created` -> `receiving`.
    async fn begin_receiving(
        &self,
        upload_id: Uuid,
        backend_upload_id: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Advance `received_offset` from `expected_offset` to `new_offset` and
    /// slide the expiry. Only applies to active sessions.
    ///
    /// When `new_offset` reaches the declared size the same update moves the
    /// session to `finalizing`, so a fully received session is never left
    /// looking writable.
    async fn advance_offset(
        &self,
        upload_id: Uuid,
        expected_offset: i64,
        new_offset: i64,
        last_activity_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move a session between two non-terminal states.
    async fn transition_state(
        &self,
        upload_id: Uuid,
        from: &str,
        to: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move a session from one of `from` into its terminal state.
    async fn finish_session(
        &self,
        upload_id: Uuid,
        from: &[&str],
        finish: &SessionFinish,
    ) -> MetadataResult<bool>;

    /// Sessions holding every declared byte but not yet finalized
    /// (`finalizing`, or `receiving` at the declared size) whose last
    /// activity is before `before`, oldest first.
    async fn get_stalled_sessions(
        &self,
        before: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Active (`created`/`receiving`) sessions whose expiry is before `now`.
    async fn get_expired_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;

    /// Session counts grouped by state.
    async fn count_sessions_by_state(&self) -> MetadataResult<Vec<StateCountRow>>;

    /// Record an uploaded part. Re-recording a part number replaces it.
    async fn put_part(&self, part: &UploadPartRow) -> MetadataResult<()>;

    /// Parts recorded for a session, in part-number order.
    async fn get_parts(&self, upload_id: Uuid) -> MetadataResult<Vec<UploadPartRow>>;

    /// Drop the part records of a finished session.
    async fn delete_parts(&self, upload_id: Uuid) -> MetadataResult<()>;
}
