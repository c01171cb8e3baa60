//! Seat allocation: booking, cancellation and waitlist promotion.
//!
//! Every decision is taken while holding the pool's write lock, and its
//! effects are committed as a single WAL event, so concurrent callers can
//! never observe a half-applied booking or cancellation.

use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::gate::{self, FALLBACK_TIER};
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, CANCELLATIONS_TOTAL, PROMOTIONS_TOTAL};
use crate::policy;

use super::{Engine, EngineError, Rejection, write_within_timeout};

fn outcome_label(result: &Result<BookOutcome, EngineError>) -> &'static str {
    match result {
        Ok(o) => o.kind.as_str(),
        Err(EngineError::Rejected(r)) => r.label(),
        Err(EngineError::ConcurrencyConflict(_)) => "conflict",
        Err(_) => "error",
    }
}

impl Engine {
    /// Book `worker_id` onto `pool_id` at `now`.
    ///
    /// Checks run in a fixed order: pool exists and is active, the release
    /// gate admits the worker's tier, the shift has not started, the worker
    /// holds no active booking on the pool. A free seat yields a confirmed
    /// `Seat`; otherwise a pending `Reservation` if the pool allows them,
    /// else `Full`.
    pub async fn book(
        &self,
        id: Ulid,
        pool_id: Ulid,
        worker_id: Ulid,
        notes: Option<String>,
        now: Ms,
    ) -> Result<BookOutcome, EngineError> {
        let result = self.try_book(id, pool_id, worker_id, notes, now).await;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        match &result {
            Ok(o) => tracing::debug!(%pool_id, %worker_id, booking = %id, kind = o.kind.as_str(), "booked"),
            Err(e) => tracing::debug!(%pool_id, %worker_id, "booking refused: {e}"),
        }
        result
    }

    async fn try_book(
        &self,
        id: Ulid,
        pool_id: Ulid,
        worker_id: Ulid,
        notes: Option<String>,
        now: Ms,
    ) -> Result<BookOutcome, EngineError> {
        if let Some(ref n) = notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("booking notes too long"));
        }
        if self.booking_to_pool.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.commit_shared(Some(pool_id)).await?;
        let config = self.config().await;
        let offset = gate::tenant_offset(&config);
        let now_local =
            ms_to_local(now, offset).ok_or(EngineError::InvalidInput("timestamp out of range"))?;
        let tier = self.worker_tier(&worker_id).unwrap_or(FALLBACK_TIER);

        let Some(shared) = self.get_pool(&pool_id) else {
            return Err(Rejection::PoolUnavailable.into());
        };
        let mut ps = write_within_timeout(shared, pool_id).await?;

        if !ps.active {
            return Err(Rejection::PoolUnavailable.into());
        }
        let decision = gate::can_view(&config, tier, ps.date, now_local);
        if !decision.allowed {
            return Err(Rejection::NotYetReleased(decision.reason).into());
        }
        if now >= ps.shift_start_ms(offset) {
            return Err(Rejection::ShiftAlreadyStarted.into());
        }
        if ps.active_booking_for(&worker_id).is_some() {
            return Err(Rejection::AlreadyBooked.into());
        }
        if ps.active_bookings().count() >= MAX_BOOKINGS_PER_POOL {
            return Err(EngineError::LimitExceeded("too many bookings on pool"));
        }

        let kind = if ps.has_free_seat() {
            BookingKind::Seat
        } else if ps.reservations_allowed {
            BookingKind::Reservation
        } else {
            return Err(Rejection::Full.into());
        };

        // The id is claimed before the WAL write so callers racing with the
        // same id, on this pool or another, cannot both commit it.
        match self.booking_to_pool.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(v) => {
                v.insert(pool_id);
            }
        }

        let event = Event::BookingPlaced {
            id,
            pool_id,
            worker_id,
            kind,
            created_at: now,
            notes,
        };
        if let Err(e) = self.persist_and_apply(&mut ps, &event).await {
            self.booking_to_pool.remove(&id);
            return Err(e);
        }
        Ok(BookOutcome { booking_id: id, kind })
    }

    /// Cancel a booking at `now`. Freeing a confirmed seat promotes the
    /// oldest pending reservation in the same commit.
    pub async fn cancel(&self, booking_id: Ulid, now: Ms) -> Result<CancelOutcome, EngineError> {
        let result = self.try_cancel(booking_id, now).await;
        let label = match &result {
            Ok(_) => "cancelled",
            Err(EngineError::CancelRefused(_)) => "refused",
            Err(EngineError::ConcurrencyConflict(_)) => "conflict",
            Err(_) => "error",
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => label).increment(1);
        if let Ok(outcome) = &result {
            tracing::debug!(booking = %booking_id, pool_id = %outcome.pool_id, "cancelled");
            if let Some(promoted) = outcome.promoted {
                metrics::counter!(PROMOTIONS_TOTAL).increment(1);
                tracing::info!(pool_id = %outcome.pool_id, booking = %promoted, "reservation promoted to seat");
            }
        }
        result
    }

    async fn try_cancel(&self, booking_id: Ulid, now: Ms) -> Result<CancelOutcome, EngineError> {
        let pool_id = self
            .pool_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;

        let _gate = self.commit_shared(Some(pool_id)).await?;
        let config = self.config().await;
        let offset = gate::tenant_offset(&config);
        let mut ps = self.lock_pool(&pool_id).await?;

        let booking = ps.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        policy::check_cancel(booking, ps.shift_start_ms(offset), &config, now)?;

        // A freed seat goes to the head of the waitlist, unless the pool is
        // still at or over capacity without it.
        let frees_seat = booking.status == BookingStatus::Confirmed
            && ps.occupied_cached.saturating_sub(1) < ps.capacity;
        let promoted = if frees_seat { ps.next_in_waitlist() } else { None };

        let event = Event::BookingCancelled {
            id: booking_id,
            pool_id,
            cancelled_at: now,
            promoted,
        };
        self.persist_and_apply(&mut ps, &event).await?;
        Ok(CancelOutcome { pool_id, promoted })
    }
}
