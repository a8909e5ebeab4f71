//! Notification state repository.

use crate::error::MetadataResult;
use crate::models::NotificationStateRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for the singleton notification state.
#[async_trait]
pub trait NotificationRepo: Send + Sync {
    /// Load the state row, creating an empty one on first use.
    async fn load_or_create_notification_state(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<NotificationStateRow>;

    /// Overwrite the state row.
    async fn save_notification_state(&self, state: &NotificationStateRow) -> MetadataResult<()>;
}
