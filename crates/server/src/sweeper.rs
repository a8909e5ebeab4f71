//! Periodic session maintenance: expiry of idle sessions, recovery of
//! stalled finalizations and reclaiming of idle admission slots.

use crate::sessions::SessionManager;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// Spawn the background sweeper. It stops when `cancel` fires.
pub fn spawn_sweeper(
    sessions: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = OffsetDateTime::now_utc();
            match sessions.sweep_expired(now).await {
                Ok(0) => {}
                Ok(expired) => {
                    tracing::info!(expired, "Expired idle upload sessions");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Session sweep failed");
                }
            }
            match sessions.recover_stalled(now).await {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::info!(recovered, "Finalized stalled upload sessions");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stalled session recovery failed");
                }
            }
            sessions.admission().release_idle();
        }
        tracing::debug!("Session sweeper stopped");
    })
}
