//! Health and statistics endpoints.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use ferry_core::UploadState;
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub storage: &'static str,
}

/// GET /health - Health check.
///
/// Checks both the metadata store and the storage backend; either failing
/// reports 503.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state
        .metadata
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("metadata store: {e}")))?;
    state
        .storage
        .health_check()
        .await
        .map_err(|e| ApiError::Unavailable(format!("storage backend: {e}")))?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        storage: state.storage.backend_name(),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStats {
    pub in_use: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    pub notifier: &'static str,
    pub notifications_sent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatsResponse {
    pub sessions: BTreeMap<String, i64>,
    /// Sessions with in-memory state in this process.
    pub live_sessions: usize,
    pub dedup_records: u64,
    pub admission: AdmissionStats,
    pub notifications: NotificationStats,
}

/// GET /uploads/stats - session counts, dedup index size, admission slots.
pub async fn upload_stats(State(state): State<AppState>) -> ApiResult<Json<UploadStatsResponse>> {
    let mut sessions: BTreeMap<String, i64> = UploadState::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for row in state.metadata.count_sessions_by_state().await? {
        sessions.insert(row.state, row.count);
    }

    let dedup_records = state.metadata.count_dedup_records().await?;
    let notification_state = state
        .metadata
        .load_or_create_notification_state(OffsetDateTime::now_utc())
        .await?;
    let admission = state.sessions.admission();

    Ok(Json(UploadStatsResponse {
        sessions,
        live_sessions: state.sessions.live_sessions(),
        dedup_records,
        admission: AdmissionStats {
            in_use: admission.in_use(),
            capacity: admission.capacity(),
        },
        notifications: NotificationStats {
            notifier: state.notifications.notifier_name(),
            notifications_sent: notification_state.notifications_sent,
            last_message_id: notification_state.last_message_id,
            updated_at: notification_state.updated_at,
        },
    }))
}
