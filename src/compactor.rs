use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

/// How often the compactor checks the WAL append counter.
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that rewrites the WAL once `threshold` appends have
/// accumulated since the last compaction. A threshold of 0 disables it.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    if threshold == 0 {
        info!("WAL compaction disabled");
        return;
    }
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran and succeeded.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            debug!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
