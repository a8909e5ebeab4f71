//! Completion notification dispatch.
//!
//! Request handlers never wait on delivery: they hand notifications to a
//! bounded channel drained by one background task. That task also owns the
//! optional trailing auto-window, and keeps [`NotificationStateRow`] in the
//! metadata store up to date (loaded at start, written after every send,
//! flushed on shutdown).

pub mod webhook;

pub use webhook::{LogNotifier, Notifier, NotifyError, WebhookNotifier};

use crate::metrics;
use ferry_core::config::NotificationConfig;
use ferry_core::{BatchDecision, BatchWindow, CompletionOutcome, FileOutcome, RetryPolicy};
use ferry_metadata::MetadataStore;
use ferry_metadata::models::NotificationStateRow;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// A message for the notification sink.
#[derive(Clone, Debug)]
pub enum Notification {
    /// One file, reported on its own.
    Single(FileOutcome),
    /// A whole window, reported as one aggregated message.
    Batch(CompletionOutcome),
}

impl Notification {
    /// Apply the batch decision of a closed window.
    pub fn for_outcome(outcome: &CompletionOutcome) -> Vec<Notification> {
        match outcome.decision {
            BatchDecision::Aggregated => vec![Notification::Batch(outcome.clone())],
            BatchDecision::Individual => outcome
                .results
                .iter()
                .cloned()
                .map(Notification::Single)
                .collect(),
        }
    }
}

enum Command {
    Dispatch(Notification),
    Record(FileOutcome),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background notification task.
#[derive(Clone)]
pub struct NotificationHub {
    tx: mpsc::Sender<Command>,
    auto_window: bool,
    notifier_name: &'static str,
}

impl NotificationHub {
    /// Spawn the dispatch task.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        metadata: Arc<dyn MetadataStore>,
        policy: RetryPolicy,
        config: &NotificationConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let auto_window = config.auto_window_ms.map(Duration::from_millis);
        let notifier_name = notifier.name();

        let dispatcher = Dispatcher {
            notifier,
            metadata,
            policy,
            batch_threshold: config.batch_threshold,
            auto_window,
            window: None,
            state: None,
        };
        tokio::spawn(dispatcher.run(rx));

        tracing::info!(
            notifier = notifier_name,
            auto_window_ms = ?config.auto_window_ms,
            batch_threshold = config.batch_threshold,
            "Notification dispatcher started"
        );

        Self {
            tx,
            auto_window: auto_window.is_some(),
            notifier_name,
        }
    }

    pub fn notifier_name(&self) -> &'static str {
        self.notifier_name
    }

    /// Queue the notifications for a closed window. Never blocks.
    pub fn dispatch(&self, outcome: &CompletionOutcome) {
        for notification in Notification::for_outcome(outcome) {
            self.enqueue(Command::Dispatch(notification));
        }
    }

    /// Record a finalized session into the trailing auto-window, if enabled.
    pub fn record_completion(&self, outcome: FileOutcome) {
        if self.auto_window {
            self.enqueue(Command::Record(outcome));
        }
    }

    fn enqueue(&self, command: Command) {
        match self.tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_notification("dropped");
                tracing::warn!("Notification queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::record_notification("dropped");
                tracing::warn!("Notification dispatcher stopped, dropping notification");
            }
        }
    }

    /// Drain queued notifications, close any open window and flush state.
    pub async fn shutdown(&self, timeout: Duration) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack_tx)).await.is_err() {
            return;
        }
        if tokio::time::timeout(timeout, ack_rx).await.is_err() {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Notification dispatcher did not drain in time"
            );
        }
    }
}

struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    metadata: Arc<dyn MetadataStore>,
    policy: RetryPolicy,
    batch_threshold: usize,
    auto_window: Option<Duration>,
    window: Option<(BatchWindow, Instant)>,
    state: Option<NotificationStateRow>,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        match self
            .metadata
            .load_or_create_notification_state(OffsetDateTime::now_utc())
            .await
        {
            Ok(state) => self.state = Some(state),
            Err(e) => tracing::warn!(error = %e, "Failed to load notification state"),
        }

        loop {
            let deadline = self.window.as_ref().map(|(_, deadline)| *deadline);
            let command = tokio::select! {
                command = rx.recv() => command,
                _ = wait_until(deadline) => {
                    self.close_window().await;
                    continue;
                }
            };

            match command {
                Some(Command::Dispatch(notification)) => self.deliver(notification).await,
                Some(Command::Record(outcome)) => self.record(outcome),
                Some(Command::Shutdown(ack)) => {
                    self.close_window().await;
                    self.flush().await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    self.close_window().await;
                    self.flush().await;
                    break;
                }
            }
        }
        tracing::debug!("Notification dispatcher stopped");
    }

    fn record(&mut self, outcome: FileOutcome) {
        let Some(quiet) = self.auto_window else {
            return;
        };
        let deadline = Instant::now() + quiet;
        match &mut self.window {
            Some((window, window_deadline)) => {
                window.record(outcome);
                *window_deadline = deadline;
            }
            None => {
                let mut window = BatchWindow::new();
                window.record(outcome);
                self.window = Some((window, deadline));
            }
        }
    }

    async fn close_window(&mut self) {
        let Some((window, _)) = self.window.take() else {
            return;
        };
        let outcome = window.close(self.batch_threshold);
        tracing::debug!(
            files = outcome.total(),
            decision = ?outcome.decision,
            "Auto-window closed"
        );
        for notification in Notification::for_outcome(&outcome) {
            self.deliver(notification).await;
        }
    }

    async fn deliver(&mut self, notification: Notification) {
        let notifier = self.notifier.clone();
        let result = self
            .policy
            .run(
                "notify",
                || notifier.send(&notification),
                NotifyError::is_retryable,
            )
            .await;

        match result {
            Ok(message_id) => {
                metrics::record_notification("sent");
                let now = OffsetDateTime::now_utc();
                let state = self.state.get_or_insert_with(|| NotificationStateRow {
                    last_message_id: None,
                    notifications_sent: 0,
                    updated_at: now,
                });
                state.notifications_sent += 1;
                if message_id.is_some() {
                    state.last_message_id = message_id;
                }
                state.updated_at = now;
                self.flush().await;
            }
            Err(e) => {
                metrics::record_notification("failed");
                tracing::warn!(
                    notifier = self.notifier.name(),
                    error = %e,
                    "Failed to deliver notification"
                );
            }
        }
    }

    async fn flush(&self) {
        let Some(state) = &self.state else {
            return;
        };
        if let Err(e) = self.metadata.save_notification_state(state).await {
            tracing::warn!(error = %e, "Failed to persist notification state");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
