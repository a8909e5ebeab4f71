//! Presigned direct upload repository.

use crate::error::MetadataResult;
use crate::models::DirectUploadRow;
use async_trait::async_trait;

/// Repository for uploads that bypass sessions through a presigned PUT.
#[async_trait]
pub trait DirectUploadRepo: Send + Sync {
    /// Record a presigned upload target.
    async fn record_direct_upload(&self, upload: &DirectUploadRow) -> MetadataResult<()>;

    /// Most recently issued presigned upload for a filename.
    async fn get_latest_direct_upload_by_filename(
        &self,
        filename: &str,
    ) -> MetadataResult<Option<DirectUploadRow>>;
}
