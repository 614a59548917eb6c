use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

const REAP_INTERVAL: Duration = Duration::from_secs(30);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Expire every pending request whose start has passed. Returns how many were expired.
pub async fn reap_once(engine: &Engine, now: i64) -> usize {
    let mut expired = 0;
    for id in engine.collect_stale_requests(now) {
        match engine.expire_request(id, now).await {
            Ok(()) => {
                info!("expired stale request {id}");
                expired += 1;
            }
            // Approved or declined in the meantime.
            Err(e) => debug!("reaper skip {id}: {e}"),
        }
    }
    if expired > 0 {
        metrics::counter!(crate::observability::REQUESTS_EXPIRED_TOTAL).increment(expired as u64);
    }
    expired
}

/// Background task that periodically expires stale pending requests.
pub async fn run_reaper(engine: Arc<Engine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        reap_once(&engine, crate::engine::now_ms()).await;
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
