//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use ferry_core::hash::{ContentHash, decode_digests};
use ferry_core::{UploadId, UploadSession, UploadState};
use sqlx::FromRow;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Upload sessions
// =============================================================================

/// Upload session record.
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub upload_id: Uuid,
    pub filename: String,
    pub declared_size: i64,
    pub received_offset: i64,
    pub state: String,
    pub object_key: String,
    pub backend_upload_id: Option<String>,
    pub content_hash: Option<String>,
    /// tus Upload-Metadata pairs as a JSON object.
    pub metadata_json: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_activity_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

impl UploadSessionRow {
    /// Decode the row into the domain session.
    pub fn into_session(self) -> MetadataResult<UploadSession> {
        let state: UploadState = self.state.parse()?;
        let content_hash = self
            .content_hash
            .as_deref()
            .map(ContentHash::from_hex)
            .transpose()?;
        let metadata = match self.metadata_json.as_deref() {
            Some(json) => serde_json::from_str::<BTreeMap<String, String>>(json).map_err(|e| {
                MetadataError::Corrupt(format!("metadata for upload {}: {e}", self.upload_id))
            })?,
            None => BTreeMap::new(),
        };

        Ok(UploadSession {
            id: UploadId::from_uuid(self.upload_id),
            filename: self.filename,
            declared_size: non_negative(self.declared_size, "declared_size")?,
            received_offset: non_negative(self.received_offset, "received_offset")?,
            state,
            object_key: self.object_key,
            backend_upload_id: self.backend_upload_id,
            content_hash,
            metadata,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            expires_at: self.expires_at,
            finished_at: self.finished_at,
            error_detail: self.error_detail,
        })
    }
}

impl From<&UploadSession> for UploadSessionRow {
    fn from(session: &UploadSession) -> Self {
        let metadata_json = (!session.metadata.is_empty())
            .then(|| serde_json::to_string(&session.metadata).ok())
            .flatten();

        Self {
            upload_id: *session.id.as_uuid(),
            filename: session.filename.clone(),
            declared_size: session.declared_size as i64,
            received_offset: session.received_offset as i64,
            state: session.state.as_str().to_string(),
            object_key: session.object_key.clone(),
            backend_upload_id: session.backend_upload_id.clone(),
            content_hash: session.content_hash.map(|h| h.to_hex()),
            metadata_json,
            error_detail: session.error_detail.clone(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            expires_at: session.expires_at,
            finished_at: session.finished_at,
        }
    }
}

fn non_negative(value: i64, column: &str) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Corrupt(format!("negative {column}: {value}")))
}

/// Terminal outcome written when a session leaves `finalizing` (or is aborted).
#[derive(Debug, Clone)]
pub struct SessionFinish {
    pub state: UploadState,
    pub object_key: String,
    pub content_hash: Option<String>,
    pub error_detail: Option<String>,
    pub finished_at: OffsetDateTime,
}

/// Per-state session count.
#[derive(Debug, Clone, FromRow)]
pub struct StateCountRow {
    pub state: String,
    pub count: i64,
}

// =============================================================================
// Upload parts
// =============================================================================

/// A backend part that has been durably uploaded for a session.
#[derive(Debug, Clone, FromRow)]
pub struct UploadPartRow {
    pub upload_id: Uuid,
    pub part_number: i32,
    pub etag: String,
    pub size_bytes: i64,
    /// Concatenated hex digests of the fingerprint blocks this part covers.
    pub block_digests: String,
    pub created_at: OffsetDateTime,
}

impl UploadPartRow {
    /// Decode the persisted block digests.
    pub fn digests(&self) -> MetadataResult<Vec<ContentHash>> {
        Ok(decode_digests(&self.block_digests)?)
    }
}

// =============================================================================
// Deduplication index
// =============================================================================

/// Content hash to stored object mapping. Written once, never updated.
#[derive(Debug, Clone, FromRow)]
pub struct DedupRecordRow {
    pub content_hash: String,
    pub object_key: String,
    pub size_bytes: i64,
    pub first_upload_id: Uuid,
    pub first_seen_at: OffsetDateTime,
}

// =============================================================================
// Direct uploads
// =============================================================================

/// A presigned PUT target handed to a client for the direct path.
#[derive(Debug, Clone, FromRow)]
pub struct DirectUploadRow {
    pub object_key: String,
    pub filename: String,
    pub declared_size: i64,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

// =============================================================================
// Notification state
// =============================================================================

/// Singleton notification bookkeeping row.
#[derive(Debug, Clone, FromRow)]
pub struct NotificationStateRow {
    pub last_message_id: Option<String>,
    pub notifications_sent: i64,
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_row_roundtrip() {
        let mut session =
            UploadSession::new("clip.mp4", 1024, time::Duration::hours(24)).unwrap();
        session.metadata.insert("filetype".into(), "video/mp4".into());
        session.content_hash = Some(ContentHash::compute(b"clip"));

        let row = UploadSessionRow::from(&session);
        assert_eq!(row.state, "created");
        assert!(row.metadata_json.is_some());

        let back = row.into_session().unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.metadata, session.metadata);
        assert_eq!(back.content_hash, session.content_hash);
        assert_eq!(back.object_key, session.object_key);
    }

    #[test]
    fn test_corrupt_state_is_reported() {
        let session = UploadSession::new("a.bin", 10, time::Duration::hours(1)).unwrap();
        let mut row = UploadSessionRow::from(&session);
        row.state = "bogus".into();
        assert!(matches!(row.into_session(), Err(MetadataError::Corrupt(_))));
    }
}
