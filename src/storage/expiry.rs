//! Background Expiry Sweeper
//!
//! Lazy expiry only removes a key when something touches it, so a key that
//! expires and is never read again would stay in memory forever. The sweeper
//! is the "active" half: a Tokio task that periodically asks the store to
//! drop every expired entry.
//!
//! The store belongs to the synchronizer's worker, so the sweeper never
//! touches it directly. Each sweep is a [`Command::PurgeExpired`] posted like
//! any client command, which keeps the single-owner rule intact.
//!
//! ## Adaptive Frequency
//!
//! If a sweep removes many keys, the next one comes sooner. If it removes
//! nothing, the sweeper backs off to save CPU.

use crate::commands::Command;
use crate::sync::{CommandSynchronizer, SyncError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Base interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// Speed up when a sweep removes at least this many keys
    pub speedup_threshold: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            speedup_threshold: 20,
        }
    }
}

impl ExpiryConfig {
    /// Default bounds around a custom starting interval.
    pub fn with_interval(base_interval: Duration) -> Self {
        let defaults = Self::default();
        Self {
            base_interval,
            min_interval: defaults.min_interval.min(base_interval),
            max_interval: defaults.max_interval.max(base_interval),
            ..defaults
        }
    }

    fn next_interval(&self, current: Duration, removed: usize) -> Duration {
        if removed >= self.speedup_threshold {
            (current / 2).max(self.min_interval)
        } else if removed == 0 {
            (current * 2).min(self.max_interval)
        } else {
            current
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background task on the current runtime.
    ///
    /// The sweeper stops when the handle is dropped or when the synchronizer
    /// stops accepting commands.
    pub fn start(synchronizer: Arc<CommandSynchronizer>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(synchronizer, config, shutdown_rx));

        info!("Background expiry sweeper started");

        Self { shutdown_tx }
    }

    /// Stops the expiry sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if self.shutdown_tx.send(true).is_ok() {
            info!("Background expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop(
    synchronizer: Arc<CommandSynchronizer>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let removed = match synchronizer
            .post_and_wait(vec![Command::PurgeExpired])
            .await
        {
            Ok(replies) => replies
                .first()
                .and_then(|reply| reply.as_integer())
                .unwrap_or(0) as usize,
            Err(SyncError::Stopped) | Err(SyncError::Cancelled) => {
                debug!("Synchronizer stopped, expiry sweeper exiting");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Expiry sweep failed");
                0
            }
        };

        let next = config.next_interval(current_interval, removed);
        if next < current_interval {
            debug!(
                expired = removed,
                new_interval_ms = next.as_millis(),
                "High expiry rate, speeding up sweeper"
            );
        } else if next > current_interval {
            trace!(
                new_interval_ms = next.as_millis(),
                "No expired keys, slowing down sweeper"
            );
        } else if removed > 0 {
            debug!(expired = removed, "Expired keys cleaned up");
        }
        current_interval = next;
    }
}
