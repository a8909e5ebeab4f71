//! Admission control for large-file sessions.
//!
//! A session larger than the routing threshold takes a slot on its first
//! chunk and keeps it while it keeps writing. Slots are keyed by upload id, so
//! repeated chunks of the same session never take a second one. A holder that
//! sends nothing for the idle bound loses its slot to the next waiter and
//! queues again on its next chunk.

use crate::metrics::ACTIVE_LARGE_SESSIONS;
use crate::sessions::error::SessionError;
use dashmap::DashMap;
use ferry_core::UploadId;
use ferry_core::config::AdmissionConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct Held {
    _permit: OwnedSemaphorePermit,
    last_used: Instant,
}

pub struct Admission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    wait: Duration,
    idle: Duration,
    held: DashMap<UploadId, Held>,
}

impl Admission {
    pub fn new(capacity: usize, wait: Duration, idle: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
            idle,
            held: DashMap::new(),
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(
            config.max_active_sessions,
            config.wait_timeout(),
            config.idle_release(),
        )
    }

    /// Take a slot for `id`, waiting up to the configured admission wait.
    ///
    /// Callers must hold the session lock so two acquisitions for the same
    /// session never race.
    pub async fn acquire(&self, id: UploadId) -> Result<(), SessionError> {
        if self.touch(&id) {
            return Ok(());
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.release_idle();
                tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned())
                    .await
                    .map_err(|_| SessionError::AdmissionTimeout {
                        retry_after_secs: self.wait.as_secs().max(1),
                    })?
                    .map_err(|_| SessionError::Corrupt("admission semaphore closed".to_string()))?
            }
        };

        self.held.insert(
            id,
            Held {
                _permit: permit,
                last_used: Instant::now(),
            },
        );
        ACTIVE_LARGE_SESSIONS.set(self.held.len() as i64);
        tracing::debug!(upload_id = %id, in_use = self.held.len(), "Admission slot acquired");
        Ok(())
    }

    /// Mark the slot held by `id` as used now. Returns false when `id` holds none.
    pub fn touch(&self, id: &UploadId) -> bool {
        match self.held.get_mut(id) {
            Some(mut held) => {
                held.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Release the slot held by `id`, if any.
    pub fn release(&self, id: &UploadId) -> bool {
        let released = self.held.remove(id).is_some();
        if released {
            ACTIVE_LARGE_SESSIONS.set(self.held.len() as i64);
            tracing::debug!(upload_id = %id, in_use = self.held.len(), "Admission slot released");
        }
        released
    }

    /// Release every slot unused for longer than the idle bound.
    pub fn release_idle(&self) -> usize {
        let idle: Vec<UploadId> = self
            .held
            .iter()
            .filter(|entry| entry.last_used.elapsed() > self.idle)
            .map(|entry| *entry.key())
            .collect();

        let mut released = 0;
        for id in idle {
            if self
                .held
                .remove_if(&id, |_, held| held.last_used.elapsed() > self.idle)
                .is_some()
            {
                released += 1;
                tracing::info!(
                    upload_id = %id,
                    idle_ms = self.idle.as_millis() as u64,
                    "Released admission slot of idle session"
                );
            }
        }
        if released > 0 {
            ACTIVE_LARGE_SESSIONS.set(self.held.len() as i64);
        }
        released
    }

    pub fn holds(&self, id: &UploadId) -> bool {
        self.held.contains_key(id)
    }

    pub fn in_use(&self) -> usize {
        self.held.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
