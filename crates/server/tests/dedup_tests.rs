//! Content deduplication across sessions.

mod common;

use axum::http::{Method, StatusCode};
use common::{TestServer, seeded_bytes, upload_offset, upload_state};
use ferry_core::ContentHash;
use serde_json::json;

#[tokio::test]
async fn test_identical_content_is_stored_once() {
    let server = TestServer::new().await;
    let data = seeded_bytes(11, 200 * 1024);

    let (first, last) = server.upload_file("render-v1.mp4", &data, 50 * 1024).await;
    assert_eq!(upload_state(&last), "completed");
    let first_status = server.status(&first).await;
    let first_key = first_status["objectKey"].as_str().unwrap().to_string();

    let (second, last) = server.upload_file("render-copy.mp4", &data, 70 * 1024).await;
    assert_eq!(upload_state(&last), "duplicate");

    let second_status = server.status(&second).await;
    assert_eq!(second_status["state"], "duplicate");
    assert_eq!(second_status["objectKey"], first_key.as_str());
    assert_eq!(second_status["contentHash"], first_status["contentHash"]);

    // The duplicate's own key was never committed.
    let second_id = second.trim_start_matches("/uploads/");
    let own_key = format!("uploads/{second_id}/render-copy.mp4");
    assert!(!server.storage().exists(&own_key).await.unwrap());
    assert!(server.storage().exists(&first_key).await.unwrap());
}

#[tokio::test]
async fn test_same_name_different_content_is_not_duplicate() {
    let server = TestServer::new().await;

    let (first, _) = server
        .upload_file("daily.log", &seeded_bytes(12, 4096), 1024)
        .await;
    let (second, last) = server
        .upload_file("daily.log", &seeded_bytes(13, 4096), 1024)
        .await;
    assert_eq!(upload_state(&last), "completed");

    let first_key = server.status(&first).await["objectKey"].clone();
    let second_key = server.status(&second).await["objectKey"].clone();
    assert_ne!(first_key, second_key);
}

#[tokio::test]
async fn test_check_duplicate_lookup() {
    let server = TestServer::new().await;
    let data = seeded_bytes(14, 64 * 1024);
    let hash = ContentHash::fingerprint(&data).to_hex();

    let (status, body) = server
        .json_request(
            Method::POST,
            "/uploads/check-duplicate",
            Some(json!({ "contentHash": hash })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], false);
    assert!(body.get("objectKey").is_none());

    let (location, _) = server.upload_file("asset.bin", &data, 16 * 1024).await;
    let key = server.status(&location).await["objectKey"].clone();

    let (status, body) = server
        .json_request(
            Method::POST,
            "/uploads/check-duplicate",
            Some(json!({ "contentHash": hash.to_uppercase() })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["objectKey"], key);
}

#[tokio::test]
async fn test_check_duplicate_rejects_malformed_hash() {
    let server = TestServer::new().await;
    let (status, _) = server
        .json_request(
            Method::POST,
            "/uploads/check-duplicate",
            Some(json!({ "contentHash": "not-hex" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_count_sessions_and_dedup_records() {
    let server = TestServer::new().await;
    let data = seeded_bytes(15, 10_000);

    server.upload_file("one.bin", &data, 4000).await;
    server.upload_file("two.bin", &data, 4000).await;
    server.create_session("pending.bin", 100).await;

    let (status, stats) = server.json_request(Method::GET, "/uploads/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["sessions"]["completed"], 1);
    assert_eq!(stats["sessions"]["duplicate"], 1);
    assert_eq!(stats["sessions"]["created"], 1);
    assert_eq!(stats["sessions"]["expired"], 0);
    assert_eq!(stats["dedupRecords"], 1);
    assert_eq!(stats["admission"]["inUse"], 0);
    assert_eq!(
        stats["admission"]["capacity"],
        server.state.config.admission.max_active_sessions
    );
}

#[tokio::test]
async fn test_concurrent_identical_finalization_stores_once() {
    let server = TestServer::new().await;
    let data = seeded_bytes(16, 96 * 1024);
    let split = 64 * 1024;

    let first = server.create_session("left.wav", data.len() as u64).await;
    let second = server.create_session("right.wav", data.len() as u64).await;
    for location in [&first, &second] {
        let response = server.patch(location, 0, data.slice(..split)).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let (left, right) = tokio::join!(
        server.patch(&first, split as u64, data.slice(split..)),
        server.patch(&second, split as u64, data.slice(split..)),
    );
    assert_eq!(left.status(), StatusCode::NO_CONTENT);
    assert_eq!(right.status(), StatusCode::NO_CONTENT);
    assert_eq!(upload_offset(&left), data.len() as u64);
    assert_eq!(upload_offset(&right), data.len() as u64);

    let mut states = [upload_state(&left), upload_state(&right)];
    states.sort();
    assert_eq!(states, ["completed", "duplicate"]);

    let left_status = server.status(&first).await;
    let right_status = server.status(&second).await;
    assert_eq!(left_status["objectKey"], right_status["objectKey"]);
    assert_eq!(left_status["contentHash"], right_status["contentHash"]);
    assert_eq!(server.metadata().count_dedup_records().await.unwrap(), 1);

    let key = left_status["objectKey"].as_str().unwrap();
    assert_eq!(server.storage().get(key).await.unwrap(), data);
}
