//! tus 1.0 upload endpoints: create, patch, head, status and abort.

use crate::error::{ApiError, ApiResult};
use crate::sessions::SessionError;
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use ferry_core::tus::{self, OFFSET_OCTET_STREAM};
use ferry_core::{UploadId, UploadSession, UploadState};
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Filename used when the client sends no `filename` metadata.
const DEFAULT_FILENAME: &str = "upload.bin";

/// JSON view of a session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub filename: String,
    pub declared_size: u64,
    pub received_offset: u64,
    pub state: UploadState,
    pub object_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<UploadSession> for UploadStatusResponse {
    fn from(session: UploadSession) -> Self {
        Self {
            upload_id: session.id.to_string(),
            filename: session.filename,
            declared_size: session.declared_size,
            received_offset: session.received_offset,
            state: session.state,
            object_key: session.object_key,
            content_hash: session.content_hash.map(|h| h.to_hex()),
            metadata: session.metadata,
            created_at: session.created_at,
            expires_at: session.expires_at,
            finished_at: session.finished_at,
            error: session.error_detail,
        }
    }
}

/// OPTIONS /uploads - tus capability discovery.
pub async fn options_uploads(State(state): State<AppState>) -> impl IntoResponse {
    let mut headers = tus_headers();
    headers.insert(tus::HEADER_TUS_VERSION, HeaderValue::from_static(tus::TUS_VERSION));
    headers.insert(
        tus::HEADER_TUS_EXTENSION,
        HeaderValue::from_static(tus::TUS_EXTENSIONS),
    );
    headers.insert(
        tus::HEADER_TUS_MAX_SIZE,
        HeaderValue::from(state.config.server.max_upload_size),
    );
    (StatusCode::NO_CONTENT, headers)
}

/// POST /uploads - create an upload session.
#[tracing::instrument(skip(state, headers))]
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let length = header_str(&headers, tus::HEADER_UPLOAD_LENGTH)
        .ok_or_else(|| ApiError::BadRequest("Upload-Length header is required".to_string()))?;
    let declared_size: i64 = length
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid Upload-Length '{length}'")))?;

    let metadata = match header_str(&headers, tus::HEADER_UPLOAD_METADATA) {
        Some(raw) => tus::parse_metadata(raw)?,
        None => BTreeMap::new(),
    };
    let filename = metadata
        .get("filename")
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    let session = state
        .sessions
        .create(&filename, declared_size, metadata)
        .await?;

    let mut response_headers = tus_headers();
    response_headers.insert(
        header::LOCATION,
        header_value(&format!("/uploads/{}", session.id))?,
    );
    response_headers.insert(
        tus::HEADER_UPLOAD_EXPIRES,
        header_value(&tus::http_date(session.expires_at))?,
    );
    response_headers.insert(tus::HEADER_UPLOAD_OFFSET, HeaderValue::from(0u64));

    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// PATCH /uploads/{upload_id} - append a chunk at `Upload-Offset`.
#[tracing::instrument(skip(state, headers, body), fields(upload_id = %upload_id))]
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let id = parse_upload_id(&upload_id)?;

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if !content_type
        .split(';')
        .next()
        .is_some_and(|ct| ct.trim().eq_ignore_ascii_case(OFFSET_OCTET_STREAM))
    {
        return Err(ApiError::UnsupportedMediaType(format!(
            "PATCH body must be {OFFSET_OCTET_STREAM}"
        )));
    }

    let raw_offset = header_str(&headers, tus::HEADER_UPLOAD_OFFSET)
        .ok_or_else(|| ApiError::BadRequest("Upload-Offset header is required".to_string()))?;
    let offset: u64 = raw_offset
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid Upload-Offset '{raw_offset}'")))?;

    let max_chunk = state.config.server.max_chunk_size;
    if let Some(length) = header_str(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok())
        && length > max_chunk
    {
        return Err(ApiError::PayloadTooLarge(format!(
            "chunk of {length} bytes exceeds the {max_chunk} byte limit"
        )));
    }

    let data = match tokio::time::timeout(
        state.config.server.chunk_timeout(),
        read_chunk(body, max_chunk),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            crate::metrics::record_upload_error("chunk_timeout");
            let current = state
                .sessions
                .status(id)
                .await
                .map(|s| s.received_offset)
                .unwrap_or(offset);
            return Err(SessionError::Timeout { offset: current }.into());
        }
    };

    let outcome = state.sessions.write_chunk(id, offset, data).await?;

    let mut response_headers = tus_headers();
    response_headers.insert(tus::HEADER_UPLOAD_OFFSET, HeaderValue::from(outcome.offset));
    response_headers.insert(
        tus::HEADER_UPLOAD_STATE,
        HeaderValue::from_static(outcome.state.as_str()),
    );
    if outcome.state.is_active() {
        response_headers.insert(
            tus::HEADER_UPLOAD_EXPIRES,
            header_value(&tus::http_date(outcome.expires_at))?,
        );
    }
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// HEAD /uploads/{upload_id} - report the authoritative offset.
pub async fn head_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_upload_id(&upload_id)?;
    let session = state.sessions.status(id).await?;

    if session.state.is_gone() {
        return Err(SessionError::Gone {
            state: session.state,
        }
        .into());
    }
    if session.state.is_active() && session.is_expired_at(OffsetDateTime::now_utc()) {
        return Err(SessionError::Gone {
            state: UploadState::Expired,
        }
        .into());
    }

    let mut headers = tus_headers();
    headers.insert(
        tus::HEADER_UPLOAD_OFFSET,
        HeaderValue::from(session.received_offset),
    );
    headers.insert(
        tus::HEADER_UPLOAD_LENGTH,
        HeaderValue::from(session.declared_size),
    );
    headers.insert(
        tus::HEADER_UPLOAD_STATE,
        HeaderValue::from_static(session.state.as_str()),
    );
    if session.state.is_active() {
        headers.insert(
            tus::HEADER_UPLOAD_EXPIRES,
            header_value(&tus::http_date(session.expires_at))?,
        );
    }
    if !session.metadata.is_empty() {
        headers.insert(
            tus::HEADER_UPLOAD_METADATA,
            header_value(&tus::encode_metadata(&session.metadata))?,
        );
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, headers).into_response())
}

/// GET /uploads/{upload_id} - full JSON status.
pub async fn get_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let id = parse_upload_id(&upload_id)?;
    let session = state.sessions.status(id).await?;
    Ok(Json(session.into()))
}

/// DELETE /uploads/{upload_id} - abort the session.
#[tracing::instrument(skip(state), fields(upload_id = %upload_id))]
pub async fn delete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_upload_id(&upload_id)?;
    state.sessions.abort(id).await?;
    Ok((StatusCode::NO_CONTENT, tus_headers()).into_response())
}

/// Collect a request body, refusing anything over `limit` bytes.
async fn read_chunk(body: Body, limit: u64) -> ApiResult<Bytes> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(frame) = stream.next().await {
        let frame =
            frame.map_err(|e| ApiError::BadRequest(format!("failed to read chunk body: {e}")))?;
        if buf.len() as u64 + frame.len() as u64 > limit {
            crate::metrics::record_upload_error("chunk_too_large");
            return Err(ApiError::PayloadTooLarge(format!(
                "chunk exceeds the {limit} byte limit"
            )));
        }
        buf.extend_from_slice(&frame);
    }
    Ok(buf.freeze())
}

/// Unknown and malformed ids are indistinguishable to clients.
fn parse_upload_id(raw: &str) -> ApiResult<UploadId> {
    UploadId::parse(raw).map_err(|_| ApiError::NotFound(format!("upload {raw} not found")))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ApiError::Internal(format!("invalid header value '{value}': {e}")))
}

fn tus_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        tus::HEADER_TUS_RESUMABLE,
        HeaderValue::from_static(tus::TUS_VERSION),
    );
    headers
}
