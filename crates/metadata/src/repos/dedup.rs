//! Content hash index repository.

use crate::error::MetadataResult;
use crate::models::DedupRecordRow;
use async_trait::async_trait;

/// Repository for the content-hash deduplication index.
#[async_trait]
pub trait DedupRepo: Send + Sync {
    /// Look up the record for a content hash.
    async fn get_dedup_record(&self, content_hash: &str) -> MetadataResult<Option<DedupRecordRow>>;

    /// Insert `record` unless its hash is already indexed, then return the
    /// stored record. Callers detect a lost race by comparing `first_upload_id`.
    async fn insert_dedup_if_absent(&self, record: &DedupRecordRow)
    -> MetadataResult<DedupRecordRow>;

    /// Number of distinct stored contents.
    async fn count_dedup_records(&self) -> MetadataResult<u64>;
}
