use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::gate;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Everything needed to open a pool besides its id.
#[derive(Debug, Clone)]
pub struct NewPool {
    pub date: NaiveDate,
    pub shift: ShiftTemplate,
    pub region_id: Ulid,
    pub capacity: u32,
    pub reservations_allowed: bool,
}

fn validate_new_pool(p: &NewPool) -> Result<(), EngineError> {
    if p.shift.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("shift name too long"));
    }
    if p.capacity > MAX_POOL_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

fn validate_config(config: &TenantConfig) -> Result<(), EngineError> {
    if !config.cancellation_lead_hours.is_finite() || config.cancellation_lead_hours < 0.0 {
        return Err(EngineError::InvalidInput(
            "cancellation lead must be a non-negative number of hours",
        ));
    }
    if config.release_times.iter().any(|t| t.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("release time too long"));
    }
    Ok(())
}

impl Engine {
    fn local_today(&self, config: &TenantConfig, now: Ms) -> Result<NaiveDate, EngineError> {
        ms_to_local(now, gate::tenant_offset(config))
            .map(|dt| dt.date())
            .ok_or(EngineError::InvalidInput("timestamp out of range"))
    }

    /// Open a pool. Pools dated before today (tenant-local) are refused, and
    /// a date + shift + region combination may only be taken once.
    pub async fn create_pool(&self, id: Ulid, pool: NewPool, now: Ms) -> Result<(), EngineError> {
        validate_new_pool(&pool)?;
        let config = self.config().await;
        if pool.date < self.local_today(&config, now)? {
            return Err(EngineError::InvalidInput("pool date is in the past"));
        }
        let _gate = self.commit_shared(Some(id)).await?;
        self.insert_pool(id, pool, now).await
    }

    async fn insert_pool(&self, id: Ulid, pool: NewPool, now: Ms) -> Result<(), EngineError> {
        if self.state.len() >= MAX_POOLS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many pools"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let key = SlotKey {
            date: pool.date,
            shift_id: pool.shift.id,
            region_id: pool.region_id,
        };
        // Claiming the slot before the WAL write makes concurrent creators
        // for the same slot race on the map entry, not on the journal.
        match self.slots.entry(key) {
            Entry::Occupied(e) => return Err(EngineError::SlotTaken(*e.get())),
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }

        let event = Event::PoolCreated {
            id,
            date: pool.date,
            shift: pool.shift.clone(),
            region_id: pool.region_id,
            capacity: pool.capacity,
            reservations_allowed: pool.reservations_allowed,
            created_at: now,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.slots.remove(&key);
            return Err(e);
        }

        let ps = PoolState::new(
            id,
            pool.date,
            pool.shift,
            pool.region_id,
            pool.capacity,
            pool.reservations_allowed,
            now,
        );
        self.state.insert(id, Arc::new(RwLock::new(ps)));
        self.notify.send(id, &event);
        tracing::info!(pool_id = %id, date = %key.date, "pool created");
        Ok(())
    }

    /// Copy a pool's shift, region, capacity and reservation setting onto
    /// other dates. Dates in the past are skipped, and so are dates whose
    /// slot is already taken; neither fails the whole request. If a commit
    /// fails part-way, the pools already created are still reported and the
    /// remaining dates come back as `failed`.
    pub async fn duplicate_pool(
        &self,
        source_id: Ulid,
        dates: &[NaiveDate],
        now: Ms,
    ) -> Result<DuplicateReport, EngineError> {
        if dates.len() > MAX_DUPLICATE_DATES {
            return Err(EngineError::LimitExceeded("too many target dates"));
        }
        let template = {
            let src = self.read_pool(&source_id).await?;
            NewPool {
                date: src.date,
                shift: src.shift.clone(),
                region_id: src.region_id,
                capacity: src.capacity,
                reservations_allowed: src.reservations_allowed,
            }
        };
        let config = self.config().await;
        let today = self.local_today(&config, now)?;

        let _gate = self.commit_shared(Some(source_id)).await?;
        let mut report = DuplicateReport::default();
        let (future, past): (Vec<NaiveDate>, Vec<NaiveDate>) =
            dates.iter().copied().partition(|date| *date >= today);
        report.rejected_past_dates = past;
        // The whole request must fit the pool budget before anything is created.
        if self.state.len() + future.len() > MAX_POOLS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many pools"));
        }

        for (i, &date) in future.iter().enumerate() {
            let id = Ulid::new();
            match self.insert_pool(id, NewPool { date, ..template.clone() }, now).await {
                Ok(()) => report.created.push((date, id)),
                Err(EngineError::SlotTaken(_)) => report.conflicts.push(date),
                Err(e) => {
                    tracing::warn!(
                        source = %source_id,
                        %date,
                        created = report.created.len(),
                        "pool duplication stopped: {e}"
                    );
                    report.failed.extend_from_slice(&future[i..]);
                    break;
                }
            }
        }
        tracing::info!(
            source = %source_id,
            created = report.created.len(),
            conflicts = report.conflicts.len(),
            past = report.rejected_past_dates.len(),
            failed = report.failed.len(),
            "pool duplicated"
        );
        Ok(report)
    }

    /// Change a pool's capacity. It may not drop below the confirmed seats
    /// in the ledger; raising it promotes waiting reservations into the new
    /// seats, oldest first. Returns the promoted booking ids.
    pub async fn set_capacity(&self, pool_id: Ulid, capacity: u32) -> Result<Vec<Ulid>, EngineError> {
        if capacity > MAX_POOL_CAPACITY {
            return Err(EngineError::LimitExceeded("capacity too large"));
        }
        let _gate = self.commit_shared(Some(pool_id)).await?;
        let mut ps = self.lock_pool(&pool_id).await?;

        let confirmed = ps.confirmed_count();
        if capacity < confirmed {
            return Err(EngineError::CapacityBelowOccupied {
                requested: capacity,
                occupied: confirmed,
            });
        }
        let free = (capacity - confirmed) as usize;
        let promoted: Vec<Ulid> = ps.waitlist().into_iter().take(free).map(|b| b.id).collect();

        let event = Event::PoolCapacitySet {
            id: pool_id,
            capacity,
            promoted: promoted.clone(),
        };
        self.persist_and_apply(&mut ps, &event).await?;
        self.reconcile_locked(&mut ps).await?;
        if !promoted.is_empty() {
            metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(promoted.len() as u64);
        }
        tracing::info!(%pool_id, capacity, promoted = promoted.len(), "pool capacity set");
        Ok(promoted)
    }

    /// Open or close a pool to new bookings. Existing bookings are kept.
    pub async fn set_active(&self, pool_id: Ulid, active: bool) -> Result<(), EngineError> {
        let _gate = self.commit_shared(Some(pool_id)).await?;
        let mut ps = self.lock_pool(&pool_id).await?;
        if ps.active != active {
            let event = Event::PoolActiveSet { id: pool_id, active };
            self.persist_and_apply(&mut ps, &event).await?;
            tracing::info!(%pool_id, active, "pool availability changed");
        }
        self.reconcile_locked(&mut ps).await?;
        Ok(())
    }

    /// Allow or stop new reservations. Pending ones stay on the waitlist.
    pub async fn set_reservations_allowed(&self, pool_id: Ulid, allowed: bool) -> Result<(), EngineError> {
        let _gate = self.commit_shared(Some(pool_id)).await?;
        let mut ps = self.lock_pool(&pool_id).await?;
        if ps.reservations_allowed != allowed {
            let event = Event::PoolReservationsSet { id: pool_id, allowed };
            self.persist_and_apply(&mut ps, &event).await?;
        }
        Ok(())
    }

    /// Record a worker's rating tier (1 to 5).
    pub async fn set_worker_tier(&self, worker_id: Ulid, tier: u8) -> Result<(), EngineError> {
        if !(1..=5).contains(&tier) {
            return Err(EngineError::InvalidInput("tier must be between 1 and 5"));
        }
        if !self.workers.contains_key(&worker_id) && self.workers.len() >= MAX_WORKERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many workers"));
        }
        let _gate = self.commit_shared(None).await?;
        let event = Event::WorkerTierSet { worker_id, tier };
        self.wal_append(&event).await?;
        self.workers.insert(worker_id, tier);
        Ok(())
    }

    /// Replace the tenant configuration. Release times are stored verbatim;
    /// malformed ones are reported here and replaced by defaults when
    /// evaluated.
    pub async fn set_config(&self, config: TenantConfig) -> Result<(), EngineError> {
        self.update_config(|current| *current = config).await.map(|_| ())
    }

    /// Apply `change` to the current configuration and commit the result.
    /// The config write lock is held from read to commit, so concurrent
    /// updates to different fields all land.
    pub async fn update_config<F>(&self, change: F) -> Result<TenantConfig, EngineError>
    where
        F: FnOnce(&mut TenantConfig),
    {
        let _gate = self.commit_shared(None).await?;
        let mut current = self.config.write().await;
        let mut next = current.clone();
        change(&mut next);
        validate_config(&next)?;

        let event = Event::ConfigUpdated { config: next.clone() };
        self.wal_append(&event).await?;
        *current = next.clone();
        gate::report_defects(&next);
        tracing::info!("tenant configuration updated");
        Ok(next)
    }
}
