//! Upload session types and lifecycle.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an upload session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(Uuid);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUploadId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Upload session state.
///
/// ```text
/// Created --first chunk--> Receiving --offset == size--> Finalizing
/// Finalizing --new content--> Completed
/// Finalizing --known content--> Duplicate
/// Finalizing --commit retries exhausted--> Failed
/// Created | Receiving --abort / ttl--> Aborted | Expired
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Session exists; no bytes accepted and no backend state opened.
    Created,
    /// At least one chunk accepted; backend multipart upload is open.
    Receiving,
    /// All bytes received; committing or short-circuiting.
    Finalizing,
    /// Content stored as a new object.
    Completed,
    /// Content already stored under another key; bytes were discarded.
    Duplicate,
    /// Session was explicitly aborted.
    Aborted,
    /// Session expired without completing.
    Expired,
    /// Finalization failed after exhausting retries.
    Failed,
}

impl UploadState {
    /// All states, in lifecycle order.
    pub const ALL: [UploadState; 8] = [
        Self::Created,
        Self::Receiving,
        Self::Finalizing,
        Self::Completed,
        Self::Duplicate,
        Self::Aborted,
        Self::Expired,
        Self::Failed,
    ];

    /// Stable lowercase name, as stored and as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Receiving => "receiving",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    /// Check if the session can still accept chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Receiving)
    }

    /// Terminal states where the content is durably stored.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Duplicate)
    }

    /// Terminal states where the upload is gone and cannot be resumed.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Aborted | Self::Expired | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Created, Receiving)
                | (Created, Aborted)
                | (Created, Expired)
                | (Created, Failed)
                | (Receiving, Finalizing)
                | (Receiving, Aborted)
                | (Receiving, Expired)
                | (Receiving, Failed)
                | (Finalizing, Completed)
                | (Finalizing, Duplicate)
                | (Finalizing, Failed)
        )
    }

    /// States that may move into `next`.
    pub fn sources(next: UploadState) -> Vec<UploadState> {
        Self::ALL
            .into_iter()
            .filter(|state| state.can_transition_to(next))
            .collect()
    }

    /// Validate a transition, returning an error naming both states.
    pub fn transition(self, next: UploadState) -> crate::Result<UploadState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(crate::Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidState(s.to_string()))
    }
}

/// An upload session tracking resumable upload state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session identifier.
    pub id: UploadId,
    /// Client-supplied filename.
    pub filename: String,
    /// Total size the client promised to send.
    pub declared_size: u64,
    /// Bytes durably accepted so far.
    pub received_offset: u64,
    /// Current session state.
    pub state: UploadState,
    /// Destination object key (for duplicates, the key already holding the content).
    pub object_key: String,
    /// Backend multipart upload handle, opened on the first chunk.
    pub backend_upload_id: Option<String>,
    /// Content fingerprint, known once finalization has hashed every byte.
    pub content_hash: Option<ContentHash>,
    /// tus Upload-Metadata pairs.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When a chunk was last accepted.
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    /// When the session expires if no further chunk arrives.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// When the session reached a terminal state.
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub finished_at: Option<OffsetDateTime>,
    /// Failure detail for failed sessions.
    pub error_detail: Option<String>,
}

impl UploadSession {
    /// Create a new upload session.
    ///
    /// Rejects non-positive sizes. No backend state is opened here.
    pub fn new(
        filename: impl Into<String>,
        declared_size: i64,
        ttl: time::Duration,
    ) -> crate::Result<Self> {
        if declared_size <= 0 {
            return Err(crate::Error::InvalidSize(declared_size));
        }
        let id = UploadId::new();
        let filename = filename.into();
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            object_key: object_key_for(&id, &filename),
            id,
            filename,
            declared_size: declared_size as u64,
            received_offset: 0,
            state: UploadState::Created,
            backend_upload_id: None,
            content_hash: None,
            metadata: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + ttl,
            finished_at: None,
            error_detail: None,
        })
    }

    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Check expiry against a fixed instant.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Bytes still missing.
    pub fn remaining(&self) -> u64 {
        self.declared_size.saturating_sub(self.received_offset)
    }

    /// Whether every declared byte has been received.
    pub fn is_fully_received(&self) -> bool {
        self.received_offset == self.declared_size
    }
}

/// Object key for an upload.
///
/// Keys are namespaced by upload id so distinct sessions uploading the same
/// filename never collide.
pub fn object_key_for(id: &UploadId, filename: &str) -> String {
    let name = sanitize_filename(filename);
    format!("uploads/{id}/{name}")
}

/// Reduce a client filename to a single safe path segment.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "upload.bin".to_string(),
        _ => cleaned,
    }
}
