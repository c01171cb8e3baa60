use chrono::NaiveDate;
use ulid::Ulid;

use crate::gate::{self, FALLBACK_TIER};
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn pool_info(&self, pool_id: Ulid) -> Result<PoolInfo, EngineError> {
        let ps = self.read_pool(&pool_id).await?;
        Ok(PoolInfo::from(&*ps))
    }

    /// A pool and its active bookings, statuses as of `now`.
    pub async fn list_pool(&self, pool_id: Ulid, now: Ms) -> Result<PoolDetail, EngineError> {
        let offset = gate::tenant_offset(&self.config().await);
        let ps = self.read_pool(&pool_id).await?;
        let shift_end = ps.shift_end_ms(offset);
        let bookings = ps
            .active_bookings()
            .map(|b| BookingInfo::new(b, b.effective_status(shift_end, now)))
            .collect();
        Ok(PoolDetail {
            pool: PoolInfo::from(&*ps),
            bookings,
        })
    }

    /// Every pool of the tenant, ordered by date, then shift start.
    pub async fn list_pools(&self) -> Vec<PoolInfo> {
        let mut pools = Vec::with_capacity(self.state.len());
        for (_, shared) in self.pool_handles() {
            pools.push(PoolInfo::from(&*shared.read().await));
        }
        pools.sort_by_key(|p| (p.date, p.shift_start, p.id));
        pools
    }

    /// Active pools the worker may book right now, optionally for one date.
    /// Same-day pools appear only once the worker's tier is released, and a
    /// pool drops out once its shift has started.
    pub async fn visible_pools(
        &self,
        worker_id: Ulid,
        date: Option<NaiveDate>,
        now: Ms,
    ) -> Result<Vec<PoolInfo>, EngineError> {
        let config = self.config().await;
        let offset = gate::tenant_offset(&config);
        let now_local =
            ms_to_local(now, offset).ok_or(EngineError::InvalidInput("timestamp out of range"))?;
        let tier = self.worker_tier(&worker_id).unwrap_or(FALLBACK_TIER);

        let mut visible = Vec::new();
        for (_, shared) in self.pool_handles() {
            let ps = shared.read().await;
            if !ps.active || date.is_some_and(|d| d != ps.date) || now >= ps.shift_start_ms(offset) {
                continue;
            }
            if gate::can_view(&config, tier, ps.date, now_local).allowed {
                visible.push(PoolInfo::from(&*ps));
            }
        }
        visible.sort_by_key(|p| (p.date, p.shift_start, p.id));
        Ok(visible)
    }

    /// All bookings a worker ever made, cancelled ones included, newest first.
    pub async fn worker_bookings(&self, worker_id: Ulid, now: Ms) -> Vec<BookingInfo> {
        let offset = gate::tenant_offset(&self.config().await);
        let mut out = Vec::new();
        for (_, shared) in self.pool_handles() {
            let ps = shared.read().await;
            let shift_end = ps.shift_end_ms(offset);
            out.extend(
                ps.bookings
                    .iter()
                    .filter(|b| b.worker_id == worker_id)
                    .map(|b| BookingInfo::new(b, b.effective_status(shift_end, now))),
            );
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// The booking with its status as of `now`.
    pub async fn booking_info(&self, booking_id: Ulid, now: Ms) -> Result<BookingInfo, EngineError> {
        let pool_id = self
            .pool_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let offset = gate::tenant_offset(&self.config().await);
        let ps = self.read_pool(&pool_id).await?;
        let b = ps.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        Ok(BookingInfo::new(b, b.effective_status(ps.shift_end_ms(offset), now)))
    }

    /// Whether the booking could be cancelled at `now`.
    pub async fn can_cancel(&self, booking_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let pool_id = self
            .pool_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let config = self.config().await;
        let offset = gate::tenant_offset(&config);
        let ps = self.read_pool(&pool_id).await?;
        let b = ps.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        Ok(crate::policy::can_cancel(b, ps.shift_start_ms(offset), &config, now))
    }
}
