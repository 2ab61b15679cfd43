//! Periodic eviction sweep.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use super::CacheStore;
use crate::cancellation::CancellationToken;
use crate::utils::now_utc;

/// Sweep schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long past its last access an expired entry is kept.
    pub grace: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            grace: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Runs `store.sweep` every `settings.interval` until `token` is cancelled.
///
/// Sweep failures are logged and the loop keeps going.
pub fn spawn_sweeper(
    store: Arc<dyn CacheStore>,
    settings: SweepSettings,
    token: Arc<CancellationToken>,
) -> JoinHandle<()> {
    let span = tracing::info_span!("cache_sweeper", interval_secs = settings.interval.as_secs());
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match store.sweep(now_utc(), settings.grace).await {
                    Ok(report) if report.removed > 0 => info!(
                        scanned = report.scanned,
                        removed = report.removed,
                        bytes_freed = report.bytes_freed,
                        "Cache sweep removed entries"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Cache sweep failed"),
                }
            }
        }
        .instrument(span),
    )
}
