//! Application state shared across handlers.

use crate::notify::{LogNotifier, NotificationHub, Notifier, WebhookNotifier};
use crate::sessions::{Admission, SessionManager, SessionSettings};
use ferry_core::config::AppConfig;
use ferry_metadata::MetadataStore;
use ferry_storage::{ObjectStore, RetryingStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Object store wrapped with the configured retry policy.
    pub storage: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub sessions: Arc<SessionManager>,
    pub notifications: NotificationHub,
}

impl AppState {
    /// Build the state, choosing the notification sink from the config.
    ///
    /// Must be called inside a Tokio runtime: it spawns the notification
    /// dispatcher.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
            Some(url) => match WebhookNotifier::new(url.clone(), config.notifications.timeout()) {
                Ok(notifier) => Arc::new(notifier),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build webhook client, logging notifications instead");
                    Arc::new(LogNotifier)
                }
            },
            None => Arc::new(LogNotifier),
        };
        Self::with_notifier(config, storage, metadata, notifier)
    }

    /// Build the state with an explicit notification sink.
    pub fn with_notifier(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        match config.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("Configuration warning: {}", warning);
                }
            }
            Err(error) => {
                panic!("Invalid configuration: {}", error);
            }
        }

        let policy = config.retry.policy();
        let storage: Arc<dyn ObjectStore> = Arc::new(RetryingStore::new(storage, policy));

        let notifications =
            NotificationHub::spawn(notifier, metadata.clone(), policy, &config.notifications);

        let sessions = Arc::new(SessionManager::new(
            SessionSettings::from_config(&config),
            Admission::from_config(&config.admission),
            storage.clone(),
            metadata.clone(),
            notifications.clone(),
        ));

        Self {
            config: Arc::new(config),
            storage,
            metadata,
            sessions,
            notifications,
        }
    }
}
