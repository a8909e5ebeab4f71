//! Notification sinks.
//!
//! [`WebhookNotifier`] posts Discord-compatible embeds and reads the created
//! message id back (`?wait=true`). [`LogNotifier`] is used when no webhook is
//! configured.

use super::Notification;
use async_trait::async_trait;
use ferry_core::completion::FileStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const COLOR_SUCCESS: u32 = 0x00ff00;
const COLOR_PARTIAL: u32 = 0xffaa00;
const COLOR_FAILURE: u32 = 0xff0000;

/// Embed field values are capped at 1024 characters by Discord.
const FIELD_VALUE_LIMIT: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned status {status}: {body}")]
    Status { status: u16, body: String },
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Destination for completion notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Returns the sink's message id, if it assigns one.
    async fn send(&self, notification: &Notification) -> Result<Option<String>, NotifyError>;

    fn name(&self) -> &'static str;
}

// =============================================================================
// Webhook
// =============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookMessage {
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Serialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

impl EmbedField {
    fn new(name: &str, value: impl Into<String>, inline: bool) -> Self {
        Self {
            name: name.to_string(),
            value: truncate_field(value.into()),
            inline,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    id: Option<String>,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<Option<String>, NotifyError> {
        let message = WebhookMessage {
            embeds: vec![render(notification, OffsetDateTime::now_utc())],
        };

        let response = self
            .client
            .post(&self.url)
            .query(&[("wait", "true")])
            .json(&message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.text().await?;
        Ok(serde_json::from_str::<WebhookResponse>(&body)
            .ok()
            .and_then(|r| r.id))
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Build the embed for a notification.
pub fn render(notification: &Notification, at: OffsetDateTime) -> Embed {
    let timestamp = at.format(&Rfc3339).unwrap_or_default();
    match notification {
        Notification::Single(outcome) => {
            let (title, color, description) = match outcome.status {
                FileStatus::Completed => (
                    "Upload complete",
                    COLOR_SUCCESS,
                    format!("{} was stored", outcome.filename),
                ),
                FileStatus::Duplicate => (
                    "Upload complete (duplicate)",
                    COLOR_SUCCESS,
                    format!("{} matches content that is already stored", outcome.filename),
                ),
                FileStatus::Failed => (
                    "Upload failed",
                    COLOR_FAILURE,
                    format!("{} did not upload", outcome.filename),
                ),
            };
            let mut fields = Vec::new();
            if let Some(key) = &outcome.object_key {
                fields.push(EmbedField::new("Object", key.clone(), false));
            }
            if let Some(detail) = &outcome.detail {
                fields.push(EmbedField::new("Reason", detail.clone(), false));
            }
            Embed {
                title: title.to_string(),
                description,
                color,
                timestamp,
                fields,
            }
        }
        Notification::Batch(outcome) => {
            let total = outcome.total();
            let (title, color) = if outcome.failed == 0 {
                ("Batch upload complete", COLOR_SUCCESS)
            } else if outcome.successful > 0 {
                ("Batch upload finished with errors", COLOR_PARTIAL)
            } else {
                ("Batch upload failed", COLOR_FAILURE)
            };
            let files = outcome
                .results
                .iter()
                .map(|r| format!("{} ({})", r.filename, status_label(r.status)))
                .collect::<Vec<_>>()
                .join("\n");
            Embed {
                title: title.to_string(),
                description: format!("{} of {total} files uploaded", outcome.successful),
                color,
                timestamp,
                fields: vec![
                    EmbedField::new("Successful", outcome.successful.to_string(), true),
                    EmbedField::new("Failed", outcome.failed.to_string(), true),
                    EmbedField::new("Duplicates", outcome.duplicates.to_string(), true),
                    EmbedField::new("Files", files, false),
                ],
            }
        }
    }
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Completed => "stored",
        FileStatus::Duplicate => "duplicate",
        FileStatus::Failed => "failed",
    }
}

fn truncate_field(value: String) -> String {
    if value.chars().count() <= FIELD_VALUE_LIMIT {
        return value;
    }
    let mut truncated: String = value.chars().take(FIELD_VALUE_LIMIT - 1).collect();
    truncated.push('…');
    truncated
}

// =============================================================================
// Log
// =============================================================================

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<Option<String>, NotifyError> {
        match notification {
            Notification::Single(outcome) => tracing::info!(
                filename = %outcome.filename,
                status = status_label(outcome.status),
                object_key = ?outcome.object_key,
                "Upload notification"
            ),
            Notification::Batch(outcome) => tracing::info!(
                files = outcome.total(),
                successful = outcome.successful,
                failed = outcome.failed,
                duplicates = outcome.duplicates,
                "Batch upload notification"
            ),
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{BatchWindow, FileOutcome};
    use time::macros::datetime;

    #[test]
    fn test_single_failure_is_red_with_reason() {
        let n = Notification::Single(FileOutcome::failed("a.wav", "no upload found"));
        let embed = render(&n, datetime!(2026-01-02 03:04:05 UTC));
        assert_eq!(embed.color, COLOR_FAILURE);
        assert_eq!(embed.timestamp, "2026-01-02T03:04:05Z");
        assert_eq!(embed.fields[0].name, "Reason");
    }

    #[test]
    fn test_batch_colour_reflects_partial_failure() {
        let mut window = BatchWindow::new();
        window.record(FileOutcome::completed("a.wav", "uploads/1/a.wav"));
        window.record(FileOutcome::failed("b.wav", "missing"));
        let n = Notification::Batch(window.close(2));

        let embed = render(&n, OffsetDateTime::now_utc());
        assert_eq!(embed.color, COLOR_PARTIAL);
        assert_eq!(embed.description, "1 of 2 files uploaded");
        let files = embed.fields.iter().find(|f| f.name == "Files").unwrap();
        assert!(files.value.contains("a.wav (stored)"));
        assert!(files.value.contains("b.wav (failed)"));
    }

    #[test]
    fn test_long_field_values_are_truncated() {
        let field = EmbedField::new("Files", "x".repeat(5000), false);
        assert_eq!(field.value.chars().count(), FIELD_VALUE_LIMIT);
    }

    #[test]
    fn test_status_errors_classify_retryability() {
        assert!(NotifyError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(NotifyError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!NotifyError::Status { status: 400, body: String::new() }.is_retryable());
    }
}
