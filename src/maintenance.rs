use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, EngineError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task: rewrites the WAL once enough appends have piled up
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last
/// compaction. Returns whether it ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    tracing::debug!(appends, threshold, "compacting WAL");
    engine.compact_wal().await?;
    Ok(true)
}
