//! Endpoint routing decisions for clients choosing an upload path.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use ferry_core::upload::sanitize_filename;
use ferry_core::{EndpointClass, RouteDecision, UploadId};
use ferry_metadata::models::DirectUploadRow;
use ferry_storage::StorageError;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Prefix for objects uploaded straight to the backend with a presigned PUT.
pub const DIRECT_PREFIX: &str = "direct";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub declared_size: i64,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    #[serde(flatten)]
    pub decision: RouteDecision,
    /// Where to create the tus session.
    pub upload_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presigned_url: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub presigned_expires_at: Option<OffsetDateTime>,
}

/// Object key a presigned direct upload of `filename` lands on.
///
/// Each target gets its own id so two clients sending the same filename never
/// overwrite each other.
pub fn direct_object_key(id: &UploadId, filename: &str) -> String {
    format!("{DIRECT_PREFIX}/{id}/{}", sanitize_filename(filename))
}

/// POST /uploads/route - pick the edge or direct path for a declared size.
pub async fn route_upload(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> ApiResult<Json<RouteResponse>> {
    let decision = state.config.router.router().route(req.declared_size)?;

    let base = match decision.target_endpoint_class {
        EndpointClass::Edge => state.config.router.edge_base_url.as_deref(),
        EndpointClass::Direct => state.config.router.direct_base_url.as_deref(),
    };
    let upload_url = format!("{}/uploads", base.unwrap_or_default().trim_end_matches('/'));

    let mut presigned_url = None;
    let mut presigned_expires_at = None;
    if decision.target_endpoint_class == EndpointClass::Direct
        && let Some(filename) = req.filename.as_deref()
    {
        let key = direct_object_key(&UploadId::new(), filename);
        match state
            .storage
            .presign_put(&key, state.config.router.presign_expiry())
            .await
        {
            Ok(presigned) => {
                state
                    .metadata
                    .record_direct_upload(&DirectUploadRow {
                        object_key: key.clone(),
                        filename: filename.to_string(),
                        declared_size: req.declared_size,
                        created_at: OffsetDateTime::now_utc(),
                        expires_at: presigned.expires_at,
                    })
                    .await?;
                tracing::debug!(object_key = %key, "Issued presigned direct upload");
                presigned_url = Some(presigned.url);
                presigned_expires_at = Some(presigned.expires_at);
            }
            Err(StorageError::Unsupported(reason)) => {
                tracing::debug!(reason = %reason, "Backend cannot presign direct uploads");
            }
            Err(e) => return Err(e.into()),
        }
    }

    tracing::debug!(
        declared_size = req.declared_size,
        target = %decision.target_endpoint_class,
        "Routed upload"
    );

    Ok(Json(RouteResponse {
        decision,
        upload_url,
        presigned_url,
        presigned_expires_at,
    }))
}
