//! Resumption across restarts, admission control and session expiry.

mod common;

use axum::http::{Method, StatusCode};
use bytes::Bytes;
use common::{
    TestServer, built_store, faulty_wrapper, seeded_bytes, sha256_hash, upload_offset,
    upload_state,
};
use ferry_core::ContentHash;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

fn session_uuid(location: &str) -> Uuid {
    Uuid::parse_str(location.trim_start_matches("/uploads/")).unwrap()
}

/// Leave a session holding every byte of `data` without finalizing it, the
/// way a process stopped between the last offset update and finalization does.
async fn store_all_bytes_without_finalizing(server: &TestServer, data: &Bytes) -> String {
    let location = server.create_session("interrupted.bin", data.len() as u64).await;
    let response = server.patch(&location, 0, data.slice(..16 * KIB)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let id = session_uuid(&location);
    let spool = server.root().join("spool").join(id.to_string()).join("0.spool");
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&spool)
        .await
        .unwrap();
    file.write_all(&data[16 * KIB..]).await.unwrap();
    file.sync_all().await.unwrap();

    let now = OffsetDateTime::now_utc();
    let ttl = server.state.config.server.session_ttl();
    let advanced = server
        .metadata()
        .advance_offset(id, 16 * KIB as i64, data.len() as i64, now, now + ttl)
        .await
        .unwrap();
    assert!(advanced);
    location
}

#[tokio::test]
async fn test_upload_resumes_after_restart() {
    let server = TestServer::new().await;
    // One full 8 MiB part is flushed before the restart, 1 MiB stays spooled.
    let data = seeded_bytes(31, 12 * MIB + 77);
    let location = server.create_session("resume.bin", data.len() as u64).await;

    let mut offset = 0usize;
    for _ in 0..3 {
        let response = server
            .patch(&location, offset as u64, data.slice(offset..offset + 3 * MIB))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        offset += 3 * MIB;
    }

    let restarted = server.restart().await;
    let head = restarted.head(&location).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(upload_offset(&head), offset as u64);

    let response = restarted
        .patch(&location, offset as u64, data.slice(offset..))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(upload_state(&response), "completed");

    let status = restarted.status(&location).await;
    assert_eq!(
        status["contentHash"],
        ferry_core::ContentHash::fingerprint(&data).to_hex()
    );
    let stored = restarted
        .storage()
        .get(status["objectKey"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(sha256_hash(&stored), sha256_hash(&data));
}

#[tokio::test]
async fn test_lost_spool_fails_the_session() {
    let server = TestServer::new().await;
    let data = seeded_bytes(32, 64 * 1024);
    let location = server.create_session("fragile.bin", data.len() as u64).await;
    server.patch(&location, 0, data.slice(..16 * 1024)).await;

    let id = location.trim_start_matches("/uploads/");
    tokio::fs::remove_dir_all(server.root().join("spool").join(id))
        .await
        .unwrap();

    let restarted = server.restart().await;
    let response = restarted
        .patch(&location, 16 * 1024, data.slice(16 * 1024..))
        .await;
    assert_eq!(response.status(), StatusCode::GONE);

    let status = restarted.status(&location).await;
    assert_eq!(status["state"], "failed");
    assert!(status["error"].as_str().unwrap().contains("spool lost"));
}

#[tokio::test]
async fn test_admission_limits_concurrent_large_sessions() {
    let server = TestServer::with_config(|config| {
        config.router.threshold_bytes = 1024;
        config.admission.max_active_sessions = 1;
        config.admission.wait_timeout_ms = 50;
    })
    .await;
    let data = seeded_bytes(33, 4096);

    let first = server.create_session("large-1.bin", 4096).await;
    let second = server.create_session("large-2.bin", 4096).await;

    let response = server.patch(&first, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = server.patch(&second, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "1");
    assert_eq!(server.status(&second).await["receivedOffset"], 0);

    // Sessions at or below the threshold never wait for a slot.
    let small = server.create_session("small.bin", 1024).await;
    let response = server.patch(&small, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(upload_state(&response), "completed");

    // Further chunks of the admitted session reuse its slot.
    let response = server.patch(&first, 1024, data.slice(1024..2048)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(server.state.sessions.admission().in_use(), 1);

    assert_eq!(server.delete(&first).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(server.state.sessions.admission().in_use(), 0);

    let response = server.patch(&second, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_completion_releases_admission_slot() {
    let server = TestServer::with_config(|config| {
        config.router.threshold_bytes = 1024;
        config.admission.max_active_sessions = 1;
        config.admission.wait_timeout_ms = 50;
    })
    .await;

    server
        .upload_file("first-large.bin", &seeded_bytes(34, 4096), 1024)
        .await;
    assert_eq!(server.state.sessions.admission().in_use(), 0);

    let (_, last) = server
        .upload_file("second-large.bin", &seeded_bytes(35, 4096), 1024)
        .await;
    assert_eq!(upload_state(&last), "completed");
}

#[tokio::test]
async fn test_sweeper_expires_idle_sessions() {
    let server = TestServer::new().await;
    let data = seeded_bytes(36, 8192);
    let idle = server.create_session("idle.bin", 8192).await;
    server.patch(&idle, 0, data.slice(..4096)).await;
    let untouched = server.create_session("untouched.bin", 10).await;

    let ttl = server.state.config.server.session_ttl();
    let later = OffsetDateTime::now_utc() + ttl + time::Duration::minutes(1);
    let expired = server.state.sessions.sweep_expired(later).await.unwrap();
    assert_eq!(expired, 2);

    for location in [&idle, &untouched] {
        assert_eq!(server.status(location).await["state"], "expired");
        assert_eq!(server.head(location).await.status(), StatusCode::GONE);
    }
    let response = server.patch(&idle, 4096, data.slice(4096..)).await;
    assert_eq!(response.status(), StatusCode::GONE);

    let id = idle.trim_start_matches("/uploads/");
    assert!(!server.root().join("spool").join(id).exists());

    // A second sweep finds nothing left to expire.
    let expired = server.state.sessions.sweep_expired(later).await.unwrap();
    assert_eq!(expired, 0);
}

#[tokio::test]
async fn test_expired_session_is_gone_before_the_sweep() {
    let server = TestServer::with_config(|config| {
        config.server.session_ttl_secs = 1;
    })
    .await;
    let data = seeded_bytes(37, 2048);
    let location = server.create_session("slow.bin", 2048).await;
    server.patch(&location, 0, data.slice(..1024)).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // HEAD reports gone without changing the stored state.
    assert_eq!(server.head(&location).await.status(), StatusCode::GONE);
    assert_eq!(server.status(&location).await["state"], "receiving");

    // A write expires the session.
    let response = server.patch(&location, 1024, data.slice(1024..)).await;
    assert_eq!(response.status(), StatusCode::GONE);
    assert_eq!(server.status(&location).await["state"], "expired");
}

#[tokio::test]
async fn test_chunks_slide_the_expiry() {
    let server = TestServer::new().await;
    let data = seeded_bytes(38, 2048);
    let location = server.create_session("sliding.bin", 2048).await;
    let created = server.status(&location).await["expiresAt"]
        .as_str()
        .unwrap()
        .to_string();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    server.patch(&location, 0, data.slice(..1024)).await;

    let slid = server.status(&location).await["expiresAt"]
        .as_str()
        .unwrap()
        .to_string();
    let created = OffsetDateTime::parse(&created, &time::format_description::well_known::Rfc3339)
        .unwrap();
    let slid =
        OffsetDateTime::parse(&slid, &time::format_description::well_known::Rfc3339).unwrap();
    assert!(slid > created);
}

#[tokio::test]
async fn test_final_offset_update_moves_to_finalizing() {
    let server = TestServer::new().await;
    let data = seeded_bytes(61, 64 * KIB);
    let location = store_all_bytes_without_finalizing(&server, &data).await;

    let status = server.status(&location).await;
    assert_eq!(status["state"], "finalizing");
    assert_eq!(status["receivedOffset"], 64 * KIB);

    // After a restart an empty write at the final offset finishes the session.
    let restarted = server.restart().await;
    let response = restarted
        .patch(&location, data.len() as u64, Bytes::new())
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(upload_state(&response), "completed");
    assert_eq!(upload_offset(&response), data.len() as u64);

    let status = restarted.status(&location).await;
    assert_eq!(status["contentHash"], ContentHash::fingerprint(&data).to_hex());
    let stored = restarted
        .storage()
        .get(status["objectKey"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(sha256_hash(&stored), sha256_hash(&data));

    // A chunk after completion is refused.
    let response = restarted
        .patch(&location, data.len() as u64, Bytes::from_static(b"x"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_fully_received_session_is_recovered() {
    let server = TestServer::new().await;
    let data = seeded_bytes(62, 64 * KIB);
    let location = store_all_bytes_without_finalizing(&server, &data).await;

    // Rows written before the combined update stayed in `receiving`.
    let id = session_uuid(&location);
    let moved = server
        .metadata()
        .transition_state(id, "finalizing", "receiving", OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert!(moved);

    // The sweep leaves a session holding every byte to recovery.
    let restarted = server.restart().await;
    let later = OffsetDateTime::now_utc() + time::Duration::days(30);
    assert_eq!(restarted.state.sessions.sweep_expired(later).await.unwrap(), 0);

    let cutoff = OffsetDateTime::now_utc() + time::Duration::seconds(1);
    let recovered = restarted
        .state
        .sessions
        .recover_finalizing(cutoff)
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let status = restarted.status(&location).await;
    assert_eq!(status["state"], "completed");
    assert_eq!(status["contentHash"], ContentHash::fingerprint(&data).to_hex());
    assert_eq!(restarted.state.sessions.live_sessions(), 0);
}

#[tokio::test]
async fn test_idle_large_session_loses_its_slot() {
    let server = TestServer::with_config(|config| {
        config.router.threshold_bytes = 1024;
        config.admission.max_active_sessions = 1;
        config.admission.wait_timeout_ms = 50;
        config.admission.idle_release_ms = 200;
    })
    .await;
    let data = seeded_bytes(63, 4096);

    let abandoned = server.create_session("abandoned.bin", 4096).await;
    let active = server.create_session("active.bin", 4096).await;

    let response = server.patch(&abandoned, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = server.patch(&active, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let response = server.patch(&active, 0, data.slice(..1024)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(server.state.sessions.admission().in_use(), 1);

    // The abandoned session queues again like any newcomer.
    let response = server.patch(&abandoned, 1024, data.slice(1024..2048)).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(server.status(&abandoned).await["receivedOffset"], 1024);
}

#[tokio::test]
async fn test_refused_requests_leave_no_session_state() {
    let server = TestServer::new().await;
    let data = seeded_bytes(64, 2048);

    for _ in 0..3 {
        let unknown = format!("/uploads/{}", Uuid::new_v4());
        let response = server.patch(&unknown, 0, data.slice(..1024)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let (location, _) = server.upload_file("done.bin", &data, 1024).await;
    let response = server.patch(&location, 2048, Bytes::from_static(b"x")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(server.delete(&location).await.status(), StatusCode::CONFLICT);

    let aborted = server.create_session("dropped.bin", 2048).await;
    server.patch(&aborted, 0, data.slice(..1024)).await;
    assert_eq!(server.delete(&aborted).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(server.delete(&aborted).await.status(), StatusCode::NO_CONTENT);
    let response = server.patch(&aborted, 1024, data.slice(1024..)).await;
    assert_eq!(response.status(), StatusCode::GONE);

    assert_eq!(server.state.sessions.live_sessions(), 0);
    let (_, stats) = server
        .json_request(Method::GET, "/uploads/stats", None)
        .await;
    assert_eq!(stats["liveSessions"], 0);
}

#[tokio::test]
async fn test_concurrent_writes_to_one_session_are_serialized() {
    let server = TestServer::new().await;
    let data = seeded_bytes(65, 8 * KIB);
    let location = server.create_session("raced.bin", 16 * KIB as u64).await;

    let (first, second) = tokio::join!(
        server.patch(&location, 0, data.clone()),
        server.patch(&location, 0, data.clone()),
    );

    let mut statuses = [first.status(), second.status()];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::NO_CONTENT, StatusCode::CONFLICT]);
    for response in [&first, &second] {
        assert_eq!(upload_offset(response), 8 * KIB as u64);
    }

    let status = server.status(&location).await;
    assert_eq!(status["receivedOffset"], 8 * KIB);
    assert_eq!(status["state"], "receiving");
}

#[tokio::test]
async fn test_chunk_timeout_reports_durable_offset() {
    let (wrap, _) =
        faulty_wrapper(|store| store.slow_parts(1, Duration::from_secs(5)));
    let server = TestServer::with_storage(
        |config| {
            config.server.chunk_timeout_secs = 2;
        },
        wrap,
    )
    .await;
    let data = seeded_bytes(66, 20 * MIB);
    let location = server.create_session("slow-backend.bin", data.len() as u64).await;

    // The chunk reaches the spool, then its part upload stalls.
    let response = server.patch(&location, 0, data.slice(..8 * MIB)).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    let reported = upload_offset(&response);

    let head = server.head(&location).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(upload_offset(&head), reported);
    assert_eq!(reported, 8 * MIB as u64);

    let mut offset = reported as usize;
    let mut last = None;
    while offset < data.len() {
        let end = (offset + 8 * MIB).min(data.len());
        let response = server
            .patch(&location, offset as u64, data.slice(offset..end))
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT, "chunk at {offset}");
        offset = end;
        last = Some(response);
    }
    assert_eq!(upload_state(&last.unwrap()), "completed");

    let status = server.status(&location).await;
    let stored = server
        .storage()
        .get(status["objectKey"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(sha256_hash(&stored), sha256_hash(&data));
}

#[tokio::test]
async fn test_exhausted_commit_retries_fail_the_session() {
    let (wrap, handle) = faulty_wrapper(|store| store.failing_complete());
    let server = TestServer::with_storage(|_| {}, wrap).await;
    let data = seeded_bytes(67, 64 * KIB);
    let location = server.create_session("uncommitted.bin", data.len() as u64).await;

    let response = server.patch(&location, 0, data.slice(..32 * KIB)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = server.patch(&location, 32 * KIB as u64, data.slice(32 * KIB..)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(upload_offset(&response), data.len() as u64);

    let store = built_store(&handle);
    assert_eq!(store.completes(), server.state.config.retry.max_attempts);
    assert!(store.aborts() >= 1);

    let status = server.status(&location).await;
    assert_eq!(status["state"], "failed");
    assert!(status["error"].as_str().is_some());
    let key = status["objectKey"].as_str().unwrap();
    assert!(!server.storage().exists(key).await.unwrap());

    let (_, outcome) = server
        .json_request(
            Method::POST,
            "/uploads/complete-batch",
            Some(serde_json::json!({ "filenames": ["uncommitted.bin"] })),
        )
        .await;
    assert_eq!(outcome["failed"], 1);
    assert_eq!(server.state.sessions.live_sessions(), 0);
}
