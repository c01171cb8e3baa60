//! Occupancy audit and reconciliation.
//!
//! The ledger is the source of truth; `occupied_cached` is a derived counter
//! that can drift. Auditing only reports. Reconciling rewrites the counter
//! from the ledger through a WAL event, so every correction is on record.

use ulid::Ulid;

use crate::model::*;
use crate::observability::{INCONSISTENCIES_TOTAL, RECONCILE_CORRECTIONS_TOTAL};

use super::{Engine, EngineError, write_within_timeout};

fn report_finding(report: &AuditReport) {
    if let Some(finding) = report.finding {
        metrics::counter!(INCONSISTENCIES_TOTAL, "kind" => finding.label()).increment(1);
        tracing::warn!(
            pool_id = %report.pool_id,
            capacity = report.capacity,
            cached = report.cached_occupied,
            actual = report.true_occupied,
            "occupancy inconsistency: {}",
            finding.label()
        );
    }
}

impl Engine {
    /// Compare one pool's counter against its ledger without changing it.
    pub async fn audit(&self, pool_id: Ulid) -> Result<AuditReport, EngineError> {
        let ps = self.read_pool(&pool_id).await?;
        let report = AuditReport::of(&ps);
        report_finding(&report);
        Ok(report)
    }

    /// Audit every pool, ordered by pool id.
    pub async fn audit_all(&self) -> Result<Vec<AuditReport>, EngineError> {
        let mut reports = Vec::with_capacity(self.state.len());
        for (_, shared) in self.pool_handles() {
            let ps = shared.read().await;
            let report = AuditReport::of(&ps);
            report_finding(&report);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Bring one pool's counter in line with its ledger. Returns whether a
    /// correction was written; reconciling a consistent pool is a no-op.
    pub async fn reconcile(&self, pool_id: Ulid) -> Result<bool, EngineError> {
        let _gate = self.commit_shared(Some(pool_id)).await?;
        let mut ps = self.lock_pool(&pool_id).await?;
        self.reconcile_locked(&mut ps).await
    }

    /// Reconcile every pool (only active ones if `active_only`). Returns the
    /// audit taken before each correction that was written. A pool that stays
    /// busy past the lock timeout is skipped and left for the next pass.
    pub async fn reconcile_all(&self, active_only: bool) -> Result<Vec<AuditReport>, EngineError> {
        let _gate = self.commit_shared(None).await?;
        let mut corrected = Vec::new();
        for (pool_id, shared) in self.pool_handles() {
            let mut ps = match write_within_timeout(shared, pool_id).await {
                Ok(ps) => ps,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(%pool_id, "pool busy, skipped by reconciliation");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if active_only && !ps.active {
                continue;
            }
            let before = AuditReport::of(&ps);
            if self.reconcile_locked(&mut ps).await? {
                corrected.push(before);
            }
        }
        Ok(corrected)
    }

    /// Reconcile a pool whose write lock the caller holds.
    pub(super) async fn reconcile_locked(&self, ps: &mut PoolState) -> Result<bool, EngineError> {
        let report = AuditReport::of(ps);
        if report.drift == 0 {
            if report.finding.is_some() {
                // Genuinely overbooked ledger: nothing to rewrite, still worth flagging.
                report_finding(&report);
            }
            return Ok(false);
        }
        report_finding(&report);

        let event = Event::OccupancyReconciled {
            pool_id: ps.id,
            before: report.cached_occupied,
            after: report.true_occupied,
        };
        self.persist_and_apply(ps, &event).await?;
        metrics::counter!(RECONCILE_CORRECTIONS_TOTAL).increment(1);
        tracing::warn!(
            pool_id = %ps.id,
            before = report.cached_occupied,
            after = report.true_occupied,
            "occupancy counter reconciled"
        );
        Ok(true)
    }
}
