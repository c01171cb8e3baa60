use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};

/// One pass over the tenant's active pools. With `auto_correct` the drifted
/// counters are rewritten (each correction is its own WAL event); without it
/// findings are only reported. Returns the number of inconsistent pools.
pub async fn reconcile_pass(engine: &Engine, auto_correct: bool) -> Result<usize, EngineError> {
    if auto_correct {
        let corrected = engine.reconcile_all(true).await?;
        if !corrected.is_empty() {
            info!(pools = corrected.len(), "reconciler corrected occupancy drift");
        }
        Ok(corrected.len())
    } else {
        let findings = engine
            .audit_all()
            .await?
            .into_iter()
            .filter(|r| !r.is_consistent())
            .count();
        if findings > 0 {
            warn!(pools = findings, "reconciler found inconsistent pools, auto-correct is off");
        }
        Ok(findings)
    }
}

/// Background task: periodic audit/reconcile of every active pool.
pub async fn run_reconciler(engine: Arc<Engine>, every: Duration, auto_correct: bool) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match reconcile_pass(&engine, auto_correct).await {
            Ok(_) => {}
            // A busy pool is picked up again on the next pass.
            Err(e) if e.is_retryable() => debug!("reconciler skipped a pass: {e}"),
            Err(e) => warn!("reconciler pass failed: {e}"),
        }
    }
}

/// Background task: compact the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(events) => debug!(appends, events, "compaction finished"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
