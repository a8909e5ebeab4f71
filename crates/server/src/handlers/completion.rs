//! Batch completion and duplicate lookup.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use ferry_core::{BatchWindow, CompletionOutcome, ContentHash, FileOutcome, UploadState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CompleteBatchRequest {
    pub filenames: Vec<String>,
}

/// POST /uploads/complete-batch - close a window over the listed files.
///
/// Each filename resolves to its most recent completed or duplicate session.
/// A filename with sessions but none of them successful counts as a failure
/// described by its latest attempt; a filename with no session at all is
/// looked up among the presigned direct uploads.
#[tracing::instrument(skip(state, req), fields(files = req.filenames.len()))]
pub async fn complete_batch(
    State(state): State<AppState>,
    Json(req): Json<CompleteBatchRequest>,
) -> ApiResult<Json<CompletionOutcome>> {
    if req.filenames.is_empty() {
        return Err(ApiError::BadRequest("filenames must not be empty".to_string()));
    }

    let mut window = BatchWindow::new();
    for filename in &req.filenames {
        window.record(resolve_outcome(&state, filename).await);
    }

    let outcome = window.close(state.config.notifications.batch_threshold);
    state.notifications.dispatch(&outcome);

    tracing::info!(
        files = outcome.total(),
        successful = outcome.successful,
        failed = outcome.failed,
        duplicates = outcome.duplicates,
        is_batch = outcome.is_batch,
        "Completion window closed"
    );
    Ok(Json(outcome))
}

async fn resolve_outcome(state: &AppState, filename: &str) -> FileOutcome {
    match state
        .metadata
        .get_latest_successful_session_by_filename(filename)
        .await
    {
        Ok(Some(row)) if row.state == UploadState::Duplicate.as_str() => {
            return FileOutcome::duplicate(filename, row.object_key);
        }
        Ok(Some(row)) => return FileOutcome::completed(filename, row.object_key),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(filename, error = %e, "Failed to look up session for completion");
            return FileOutcome::failed(filename, format!("lookup failed: {e}"));
        }
    }

    match state.metadata.get_latest_session_by_filename(filename).await {
        Ok(Some(row)) => {
            let label = row
                .state
                .parse::<UploadState>()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| row.state.clone());
            let detail = match row.error_detail {
                Some(detail) => format!("upload {label}: {detail}"),
                None => format!("upload {label}"),
            };
            FileOutcome::failed(filename, detail)
        }
        Ok(None) => direct_outcome(state, filename)
            .await
            .unwrap_or_else(|| FileOutcome::failed(filename, "no completed upload found")),
        Err(e) => {
            tracing::warn!(filename, error = %e, "Failed to look up session for completion");
            FileOutcome::failed(filename, format!("lookup failed: {e}"))
        }
    }
}

/// A presigned direct upload leaves no session, only its recorded target.
async fn direct_outcome(state: &AppState, filename: &str) -> Option<FileOutcome> {
    let upload = match state
        .metadata
        .get_latest_direct_upload_by_filename(filename)
        .await
    {
        Ok(upload) => upload?,
        Err(e) => {
            tracing::warn!(filename, error = %e, "Failed to look up direct upload");
            return None;
        }
    };
    match state.storage.exists(&upload.object_key).await {
        Ok(true) => Some(FileOutcome::completed(filename, upload.object_key)),
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(filename, error = %e, "Failed to check direct upload");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDuplicateRequest {
    pub content_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDuplicateResponse {
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
}

/// POST /uploads/check-duplicate - look a content hash up in the dedup index.
pub async fn check_duplicate(
    State(state): State<AppState>,
    Json(req): Json<CheckDuplicateRequest>,
) -> ApiResult<Json<CheckDuplicateResponse>> {
    let hash = ContentHash::from_hex(&req.content_hash)?;
    let record = state.metadata.get_dedup_record(&hash.to_hex()).await?;
    Ok(Json(CheckDuplicateResponse {
        duplicate: record.is_some(),
        object_key: record.map(|r| r.object_key),
    }))
}
