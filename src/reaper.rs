use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::observability::SWEEP_FAILURES_TOTAL;

/// Background task that periodically expires lapsed holds.
///
/// A failed pass is logged and counted; the next tick simply tries again.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

async fn sweep_once(engine: &Engine) -> Option<usize> {
    match engine.release_expired_reservations().await {
        Ok(0) => {
            debug!("sweep: nothing expired");
            Some(0)
        }
        Ok(n) => {
            info!("sweep expired {n} reservations");
            Some(n)
        }
        Err(e) => {
            error!("sweep failed: {e}");
            metrics::counter!(SWEEP_FAILURES_TOTAL).increment(1);
            None
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
