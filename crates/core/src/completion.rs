//! Completion aggregation policy.
//!
//! A [`BatchWindow`] collects per-file completion results. Closing the window
//! yields a [`CompletionOutcome`] whose [`BatchDecision`] says whether one
//! aggregated notification or one notification per file should be sent.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Default number of files at which completions are reported as one batch.
pub const DEFAULT_BATCH_THRESHOLD: usize = 2;

/// Result for a single file in a completion window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Stored as a new object.
    Completed,
    /// Content was already stored.
    Duplicate,
    /// Unknown, unfinished, or failed upload.
    Failed,
}

impl FileStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Duplicate)
    }
}

/// Outcome for one filename.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub filename: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FileOutcome {
    pub fn completed(filename: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: FileStatus::Completed,
            object_key: Some(object_key.into()),
            detail: None,
        }
    }

    pub fn duplicate(filename: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: FileStatus::Duplicate,
            object_key: Some(object_key.into()),
            detail: None,
        }
    }

    pub fn failed(filename: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: FileStatus::Failed,
            object_key: None,
            detail: Some(detail.into()),
        }
    }
}

/// How a closed window is announced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchDecision {
    /// One notification per file.
    Individual,
    /// A single aggregated notification for the whole window.
    Aggregated,
}

impl BatchDecision {
    /// Decide for a window of `count` files. `threshold` is clamped to at least 2
    /// so a lone file is never reported as a batch.
    pub fn for_count(count: usize, threshold: usize) -> Self {
        if count >= threshold.max(2) {
            Self::Aggregated
        } else {
            Self::Individual
        }
    }
}

/// Ephemeral group of completion events.
#[derive(Clone, Debug)]
pub struct BatchWindow {
    results: Vec<FileOutcome>,
    opened_at: OffsetDateTime,
}

impl BatchWindow {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            opened_at: OffsetDateTime::now_utc(),
        }
    }

    /// Record a completion for a file.
    pub fn record(&mut self, outcome: FileOutcome) {
        self.results.push(outcome);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Close the window and apply the batch policy.
    pub fn close(self, threshold: usize) -> CompletionOutcome {
        let decision = BatchDecision::for_count(self.results.len(), threshold);
        let successful = self.results.iter().filter(|r| r.status.is_success()).count();
        let duplicates = self
            .results
            .iter()
            .filter(|r| r.status == FileStatus::Duplicate)
            .count();
        CompletionOutcome {
            is_batch: decision == BatchDecision::Aggregated,
            decision,
            successful,
            failed: self.results.len() - successful,
            duplicates,
            results: self.results,
            opened_at: self.opened_at,
            closed_at: OffsetDateTime::now_utc(),
        }
    }
}

impl Default for BatchWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// A closed window with its aggregation decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub is_batch: bool,
    pub decision: BatchDecision,
    pub successful: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub results: Vec<FileOutcome>,
    #[serde(with = "time::serde::rfc3339")]
    pub opened_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub closed_at: OffsetDateTime,
}

impl CompletionOutcome {
    pub fn total(&self) -> usize {
        self.results.len()
    }
}
