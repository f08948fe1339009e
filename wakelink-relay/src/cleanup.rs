//! Background cleanup task for stale relay state.
//!
//! Runs periodically to purge queued packets past their retention, forget
//! idle delivery lanes, and shrink rate limiter tables.

use crate::config::CleanupConfig;
use crate::server::WakeRelay;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    relay: Arc<WakeRelay>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let retention = Duration::from_secs(config.retention_secs);
        tracing::info!(
            "Cleanup task started (interval: {}s, retention: {}s)",
            config.interval_secs,
            config.retention_secs
        );

        let mut timer = interval(Duration::from_secs(config.interval_secs));

        loop {
            timer.tick().await;
            run_once(&relay, retention);
        }
    })
}

fn run_once(relay: &WakeRelay, retention: Duration) {
    let purged = relay.purge_expired(retention);
    let lanes = relay.prune_idle_lanes();
    relay.rate_limits().shrink();

    if purged > 0 {
        tracing::info!("Cleanup: purged {} expired packets", purged);
    } else {
        tracing::debug!("Cleanup: no expired packets ({} idle lanes pruned)", lanes);
    }
}
