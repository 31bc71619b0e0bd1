//! Periodic eviction of dead and idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::SessionRegistry;
use super::multiplexer::now_millis;
use super::shell::SessionId;

/// Default time between sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default inactivity limit.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Removes sessions whose shell died or that saw no activity for too long.
pub struct Reaper {
    registry: Arc<SessionRegistry>,
    interval: Duration,
    idle_timeout: Duration,
}

impl Reaper {
    /// Creates a reaper with the default interval and idle timeout.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self::with_timing(registry, DEFAULT_REAP_INTERVAL, DEFAULT_IDLE_TIMEOUT)
    }

    /// Creates a reaper with explicit timing.
    pub fn with_timing(registry: Arc<SessionRegistry>, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_timeout,
        }
    }

    /// Runs one sweep against the current time.
    pub async fn sweep(&self) -> Vec<SessionId> {
        self.sweep_at(now_millis()).await
    }

    /// Runs one sweep as if the clock read `now` (Unix epoch milliseconds).
    ///
    /// Returns the ids that were removed.
    pub async fn sweep_at(&self, now: u64) -> Vec<SessionId> {
        let idle_limit = self.idle_timeout.as_millis() as u64;
        let mut expired = Vec::new();

        for session in self.registry.sessions() {
            let idle = now.saturating_sub(session.last_activity());
            if !session.is_alive() {
                tracing::debug!(session_id = %session.id(), "Reaping dead session");
                expired.push(session.id().clone());
            } else if idle > idle_limit {
                tracing::info!(
                    session_id = %session.id(),
                    idle_secs = idle / 1000,
                    "Reaping idle session"
                );
                expired.push(session.id().clone());
            }
        }

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if self.registry.remove(&id).await {
                removed.push(id);
            }
        }

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Reaper sweep removed sessions");
        }
        removed
    }

    /// Runs sweeps on a fixed interval until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }
}
