use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Rewrite the WAL as the minimal event sequence that rebuilds the
    /// current state: the config, every worker tier, and one snapshot per
    /// pool. Snapshots carry the cached counter as-is, drift included.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        // No mutation may commit between the snapshot and the swap.
        let _exclusive = self.commit_gate.write().await;

        let mut events = vec![Event::ConfigUpdated {
            config: self.config().await,
        }];
        let mut tiers: Vec<(ulid::Ulid, u8)> =
            self.workers.iter().map(|e| (*e.key(), *e.value())).collect();
        tiers.sort();
        events.extend(
            tiers
                .into_iter()
                .map(|(worker_id, tier)| Event::WorkerTierSet { worker_id, tier }),
        );

        for (_, shared) in self.pool_handles() {
            let ps = shared.read().await;
            events.push(Event::PoolSnapshot {
                pool: ps.record(),
                bookings: ps.bookings.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = count, "WAL compacted");
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
