//! Completion notifications: webhook delivery and automatic windows.

mod common;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use common::{TestServer, can_bind_localhost, seeded_bytes};
use ferry_core::completion::FileStatus;
use ferry_server::notify::{Notification, Notifier, NotifyError};
use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CollectingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl CollectingNotifier {
    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    async fn send(&self, notification: &Notification) -> Result<Option<String>, NotifyError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(notification.clone());
        Ok(Some(format!("collected-{}", sent.len())))
    }

    fn name(&self) -> &'static str {
        "collecting"
    }
}

async fn complete(server: &TestServer, filenames: &[&str]) -> serde_json::Value {
    let (status, body) = server
        .json_request(
            Method::POST,
            "/uploads/complete-batch",
            Some(json!({ "filenames": filenames })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn test_batch_is_posted_to_webhook_and_state_persisted() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let hook = MockServer::start_async().await;
    let mock = hook
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/webhooks/1/token")
                .query_param("wait", "true");
            then.status(200).json_body(json!({ "id": "msg-42" }));
        })
        .await;

    let url = hook.url("/api/webhooks/1/token");
    let server = TestServer::with_config(move |config| {
        config.notifications.webhook_url = Some(url);
    })
    .await;
    assert_eq!(server.state.notifications.notifier_name(), "webhook");

    server.upload_file("a.wav", &seeded_bytes(41, 2048), 1024).await;
    server.upload_file("b.wav", &seeded_bytes(42, 2048), 1024).await;
    let body = complete(&server, &["a.wav", "b.wav"]).await;
    assert_eq!(body["isBatch"], true);

    server
        .state
        .notifications
        .shutdown(Duration::from_secs(5))
        .await;
    mock.assert_hits_async(1).await;

    let (_, stats) = server
        .json_request(Method::GET, "/uploads/stats", None)
        .await;
    assert_eq!(stats["notifications"]["notifier"], "webhook");
    assert_eq!(stats["notifications"]["notificationsSent"], 1);
    assert_eq!(stats["notifications"]["lastMessageId"], "msg-42");
}

#[tokio::test]
async fn test_failing_webhook_is_retried_then_dropped() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let hook = MockServer::start_async().await;
    let mock = hook
        .mock_async(|when, then| {
            when.method(POST).path("/hook");
            then.status(503).body("busy");
        })
        .await;

    let url = hook.url("/hook");
    let server = TestServer::with_config(move |config| {
        config.notifications.webhook_url = Some(url);
    })
    .await;

    server.upload_file("only.wav", &seeded_bytes(43, 512), 512).await;
    let body = complete(&server, &["only.wav"]).await;
    assert_eq!(body["successful"], 1);

    server
        .state
        .notifications
        .shutdown(Duration::from_secs(5))
        .await;
    // for_testing() allows three attempts.
    mock.assert_hits_async(3).await;

    let (_, stats) = server
        .json_request(Method::GET, "/uploads/stats", None)
        .await;
    assert_eq!(stats["notifications"]["notificationsSent"], 0);
}

#[tokio::test]
async fn test_individual_notifications_below_threshold() {
    let notifier = Arc::new(CollectingNotifier::default());
    let server = TestServer::with_notifier(|_| {}, notifier.clone()).await;

    server.upload_file("one.wav", &seeded_bytes(44, 1000), 500).await;
    complete(&server, &["one.wav"]).await;
    server
        .state
        .notifications
        .shutdown(Duration::from_secs(5))
        .await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Notification::Single(outcome) => {
            assert_eq!(outcome.filename, "one.wav");
            assert_eq!(outcome.status, FileStatus::Completed);
        }
        other => panic!("expected a single notification, got {other:?}"),
    }
}

#[tokio::test]
async fn test_auto_window_aggregates_finalized_sessions() {
    let notifier = Arc::new(CollectingNotifier::default());
    let server = TestServer::with_notifier(
        |config| {
            config.notifications.auto_window_ms = Some(400);
        },
        notifier.clone(),
    )
    .await;

    let data = seeded_bytes(45, 1500);
    server.upload_file("first.mov", &data, 500).await;
    server.upload_file("second.mov", &data, 500).await;
    server.upload_file("third.mov", &seeded_bytes(46, 800), 800).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    server
        .state
        .notifications
        .shutdown(Duration::from_secs(5))
        .await;

    let sent = notifier.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Notification::Batch(outcome) => {
            assert_eq!(outcome.total(), 3);
            assert_eq!(outcome.successful, 3);
            assert_eq!(outcome.duplicates, 1);
            assert!(outcome.is_batch);
        }
        other => panic!("expected a batch notification, got {other:?}"),
    }
}
