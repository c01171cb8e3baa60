use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every instant the engine stores or receives is one.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Wall clock. Only the outer layers read it; the engine takes `now` as input.
pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a tenant-local wall-clock time to an absolute instant.
pub fn local_to_ms(local: NaiveDateTime, offset: FixedOffset) -> Ms {
    (local - Duration::seconds(i64::from(offset.local_minus_utc())))
        .and_utc()
        .timestamp_millis()
}

/// Convert an absolute instant to tenant-local wall-clock time.
pub fn ms_to_local(ms: Ms, offset: FixedOffset) -> Option<NaiveDateTime> {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|utc| utc.with_timezone(&offset).naive_local())
}

/// The shift a pool is cut from: display name plus local start/end times.
/// An end at or before the start means the shift runs past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftTemplate {
    pub id: Ulid,
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ShiftTemplate {
    pub fn starts_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.start)
    }

    pub fn ends_on(&self, date: NaiveDate) -> NaiveDateTime {
        let end = date.and_time(self.end);
        if self.end <= self.start {
            end + Duration::days(1)
        } else {
            end
        }
    }
}

/// Whether a booking holds a seat or waits for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Seat,
    Reservation,
}

impl BookingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingKind::Seat => "seat",
            BookingKind::Reservation => "reservation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    /// Never stored: derived for confirmed bookings whose shift has ended.
    Completed,
}

impl BookingStatus {
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

/// One worker's claim against a pool. Ledger rows are never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub pool_id: Ulid,
    pub worker_id: Ulid,
    pub kind: BookingKind,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub notes: Option<String>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Status as reported to callers: a confirmed booking whose shift is over
    /// reads as `Completed`.
    pub fn effective_status(&self, shift_end: Ms, now: Ms) -> BookingStatus {
        if self.status == BookingStatus::Confirmed && now >= shift_end {
            BookingStatus::Completed
        } else {
            self.status
        }
    }
}

/// Uniqueness key for pools: one pool per date + shift template + region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub shift_id: Ulid,
    pub region_id: Ulid,
}

/// Durable pool record without its ledger (WAL snapshots, query results).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: Ulid,
    pub date: NaiveDate,
    pub shift: ShiftTemplate,
    pub region_id: Ulid,
    pub capacity: u32,
    pub occupied_cached: u32,
    pub active: bool,
    pub reservations_allowed: bool,
    pub created_at: Ms,
}

/// A pool and its booking ledger. Guarded by one `RwLock` per pool.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub id: Ulid,
    pub date: NaiveDate,
    pub shift: ShiftTemplate,
    pub region_id: Ulid,
    pub capacity: u32,
    /// Derived occupancy counter; the ledger below is the source of truth.
    pub occupied_cached: u32,
    pub active: bool,
    pub reservations_allowed: bool,
    pub created_at: Ms,
    /// All bookings in creation order.
    pub bookings: Vec<Booking>,
}

impl PoolState {
    pub fn new(
        id: Ulid,
        date: NaiveDate,
        shift: ShiftTemplate,
        region_id: Ulid,
        capacity: u32,
        reservations_allowed: bool,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            date,
            shift,
            region_id,
            capacity,
            occupied_cached: 0,
            active: true,
            reservations_allowed,
            created_at,
            bookings: Vec::new(),
        }
    }

    pub fn from_record(record: PoolRecord, bookings: Vec<Booking>) -> Self {
        Self {
            id: record.id,
            date: record.date,
            shift: record.shift,
            region_id: record.region_id,
            capacity: record.capacity,
            occupied_cached: record.occupied_cached,
            active: record.active,
            reservations_allowed: record.reservations_allowed,
            created_at: record.created_at,
            bookings,
        }
    }

    pub fn record(&self) -> PoolRecord {
        PoolRecord {
            id: self.id,
            date: self.date,
            shift: self.shift.clone(),
            region_id: self.region_id,
            capacity: self.capacity,
            occupied_cached: self.occupied_cached,
            active: self.active,
            reservations_allowed: self.reservations_allowed,
            created_at: self.created_at,
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            date: self.date,
            shift_id: self.shift.id,
            region_id: self.region_id,
        }
    }

    pub fn shift_start_ms(&self, offset: FixedOffset) -> Ms {
        local_to_ms(self.shift.starts_on(self.date), offset)
    }

    pub fn shift_end_ms(&self, offset: FixedOffset) -> Ms {
        local_to_ms(self.shift.ends_on(self.date), offset)
    }

    /// Confirmed seats counted from the ledger.
    pub fn confirmed_count(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .count() as u32
    }

    pub fn has_free_seat(&self) -> bool {
        self.occupied_cached < self.capacity
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    pub fn active_booking_for(&self, worker_id: &Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.worker_id == *worker_id && b.is_active())
    }

    /// Pending reservations, oldest first. Ties on `created_at` fall back to
    /// the ULID, which is itself time-ordered.
    pub fn waitlist(&self) -> Vec<&Booking> {
        let mut pending: Vec<&Booking> = self
            .bookings
            .iter()
            .filter(|b| b.kind == BookingKind::Reservation && b.status == BookingStatus::Pending)
            .collect();
        pending.sort_by_key(|b| (b.created_at, b.id));
        pending
    }

    pub fn next_in_waitlist(&self) -> Option<Ulid> {
        self.waitlist().first().map(|b| b.id)
    }

    pub fn active_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.is_active())
    }
}

/// Release schedule and cancellation policy supplied by the tenant.
///
/// Release times are kept as the raw text the tenant configured so that a
/// malformed value can be detected (and replaced) at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub release_enabled: bool,
    /// Index 0 is tier 1, index 4 is tier 5.
    pub release_times: [String; 5],
    pub cancellation_enabled: bool,
    pub cancellation_lead_hours: f64,
    pub utc_offset_minutes: i32,
}

pub const DEFAULT_RELEASE_TIMES: [&str; 5] = ["12:00:00", "11:00:00", "10:00:00", "09:00:00", "08:00:00"];
pub const DEFAULT_CANCELLATION_LEAD_HOURS: f64 = 2.0;
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = -180;

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            release_enabled: true,
            release_times: DEFAULT_RELEASE_TIMES.map(String::from),
            cancellation_enabled: true,
            cancellation_lead_hours: DEFAULT_CANCELLATION_LEAD_HOURS,
            utc_offset_minutes: DEFAULT_UTC_OFFSET_MINUTES,
        }
    }
}

impl TenantConfig {
    /// `None` when the configured offset is outside ±24h.
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }
}

/// WAL record format. Every state change is exactly one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PoolCreated {
        id: Ulid,
        date: NaiveDate,
        shift: ShiftTemplate,
        region_id: Ulid,
        capacity: u32,
        reservations_allowed: bool,
        created_at: Ms,
    },
    /// `promoted` lists reservations moved into the seats the increase opened.
    PoolCapacitySet {
        id: Ulid,
        capacity: u32,
        promoted: Vec<Ulid>,
    },
    PoolActiveSet {
        id: Ulid,
        active: bool,
    },
    PoolReservationsSet {
        id: Ulid,
        allowed: bool,
    },
    BookingPlaced {
        id: Ulid,
        pool_id: Ulid,
        worker_id: Ulid,
        kind: BookingKind,
        created_at: Ms,
        notes: Option<String>,
    },
    /// Cancellation and the promotion it triggers are one record.
    BookingCancelled {
        id: Ulid,
        pool_id: Ulid,
        cancelled_at: Ms,
        promoted: Option<Ulid>,
    },
    OccupancyReconciled {
        pool_id: Ulid,
        before: u32,
        after: u32,
    },
    WorkerTierSet {
        worker_id: Ulid,
        tier: u8,
    },
    ConfigUpdated {
        config: TenantConfig,
    },
    /// Emitted only by compaction: the full pool state in one record.
    PoolSnapshot {
        pool: PoolRecord,
        bookings: Vec<Booking>,
    },
}

impl Event {
    /// The pool an event belongs to, if any.
    pub fn pool_id(&self) -> Option<Ulid> {
        match self {
            Event::PoolCreated { id, .. }
            | Event::PoolCapacitySet { id, .. }
            | Event::PoolActiveSet { id, .. }
            | Event::PoolReservationsSet { id, .. } => Some(*id),
            Event::BookingPlaced { pool_id, .. }
            | Event::BookingCancelled { pool_id, .. }
            | Event::OccupancyReconciled { pool_id, .. } => Some(*pool_id),
            Event::PoolSnapshot { pool, .. } => Some(pool.id),
            Event::WorkerTierSet { .. } | Event::ConfigUpdated { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub id: Ulid,
    pub date: NaiveDate,
    pub shift_id: Ulid,
    pub shift_name: String,
    pub shift_start: NaiveTime,
    pub shift_end: NaiveTime,
    pub region_id: Ulid,
    pub capacity: u32,
    pub occupied: u32,
    pub waitlisted: u32,
    pub active: bool,
    pub reservations_allowed: bool,
}

impl From<&PoolState> for PoolInfo {
    fn from(ps: &PoolState) -> Self {
        PoolInfo {
            id: ps.id,
            date: ps.date,
            shift_id: ps.shift.id,
            shift_name: ps.shift.name.clone(),
            shift_start: ps.shift.start,
            shift_end: ps.shift.end,
            region_id: ps.region_id,
            capacity: ps.capacity,
            occupied: ps.occupied_cached,
            waitlisted: ps.waitlist().len() as u32,
            active: ps.active,
            reservations_allowed: ps.reservations_allowed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingInfo {
    pub id: Ulid,
    pub pool_id: Ulid,
    pub worker_id: Ulid,
    pub kind: BookingKind,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    pub notes: Option<String>,
}

impl BookingInfo {
    pub fn new(b: &Booking, status: BookingStatus) -> Self {
        BookingInfo {
            id: b.id,
            pool_id: b.pool_id,
            worker_id: b.worker_id,
            kind: b.kind,
            status,
            created_at: b.created_at,
            cancelled_at: b.cancelled_at,
            notes: b.notes.clone(),
        }
    }
}

/// `ListPool`: a pool plus its active bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolDetail {
    pub pool: PoolInfo,
    pub bookings: Vec<BookingInfo>,
}

/// Result of a successful `book`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookOutcome {
    pub booking_id: Ulid,
    pub kind: BookingKind,
}

/// Result of a successful `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub pool_id: Ulid,
    pub promoted: Option<Ulid>,
}

/// Disagreement between the cached counter and the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Inconsistency {
    /// More seats occupied than the pool holds.
    Overbooked { occupied: u32, capacity: u32 },
    /// Counter and ledger disagree within capacity.
    Desync { drift: i64 },
}

impl Inconsistency {
    pub fn label(&self) -> &'static str {
        match self {
            Inconsistency::Overbooked { .. } => "overbooked",
            Inconsistency::Desync { .. } => "desync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub pool_id: Ulid,
    pub capacity: u32,
    pub true_occupied: u32,
    pub cached_occupied: u32,
    /// `cached_occupied - true_occupied`.
    pub drift: i64,
    pub finding: Option<Inconsistency>,
}

impl AuditReport {
    pub fn of(ps: &PoolState) -> Self {
        let true_occupied = ps.confirmed_count();
        let cached_occupied = ps.occupied_cached;
        let drift = i64::from(cached_occupied) - i64::from(true_occupied);
        let finding = if cached_occupied > ps.capacity || true_occupied > ps.capacity {
            Some(Inconsistency::Overbooked {
                occupied: cached_occupied.max(true_occupied),
                capacity: ps.capacity,
            })
        } else if drift != 0 {
            Some(Inconsistency::Desync { drift })
        } else {
            None
        };
        AuditReport {
            pool_id: ps.id,
            capacity: ps.capacity,
            true_occupied,
            cached_occupied,
            drift,
            finding,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.finding.is_none()
    }
}

/// Per-date outcome of `duplicate_pool`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateReport {
    pub created: Vec<(NaiveDate, Ulid)>,
    pub conflicts: Vec<NaiveDate>,
    pub rejected_past_dates: Vec<NaiveDate>,
    /// Dates left uncreated after a commit failed part-way through.
    pub failed: Vec<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn pool() -> PoolState {
        let shift = ShiftTemplate {
            id: Ulid::new(),
            name: "Almoço".into(),
            start: t(11, 0),
            end: t(15, 0),
        };
        PoolState::new(Ulid::new(), d(2026, 10, 20), shift, Ulid::new(), 2, true, 0)
    }

    fn booking(pool: &PoolState, kind: BookingKind, status: BookingStatus, created_at: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            pool_id: pool.id,
            worker_id: Ulid::new(),
            kind,
            status,
            created_at,
            cancelled_at: None,
            notes: None,
        }
    }

    #[test]
    fn overnight_shift_ends_next_day() {
        let shift = ShiftTemplate {
            id: Ulid::new(),
            name: "Madrugada".into(),
            start: t(22, 0),
            end: t(2, 0),
        };
        let date = d(2026, 10, 20);
        assert_eq!(shift.ends_on(date), d(2026, 10, 21).and_time(t(2, 0)));
        assert_eq!(shift.starts_on(date), date.and_time(t(22, 0)));
    }

    #[test]
    fn local_conversion_round_trips_through_offset() {
        let offset = FixedOffset::east_opt(-3 * 3600).unwrap();
        let local = d(2026, 10, 20).and_time(t(8, 0));
        let ms = local_to_ms(local, offset);
        // 08:00 at UTC-3 is 11:00 UTC.
        let utc = chrono::DateTime::from_timestamp_millis(ms).unwrap();
        assert_eq!(utc.naive_utc(), d(2026, 10, 20).and_time(t(11, 0)));
        assert_eq!(ms_to_local(ms, offset), Some(local));
    }

    #[test]
    fn effective_status_derives_completed() {
        let p = pool();
        let b = booking(&p, BookingKind::Seat, BookingStatus::Confirmed, 0);
        assert_eq!(b.effective_status(1_000, 999), BookingStatus::Confirmed);
        assert_eq!(b.effective_status(1_000, 1_000), BookingStatus::Completed);

        let pending = booking(&p, BookingKind::Reservation, BookingStatus::Pending, 0);
        assert_eq!(pending.effective_status(1_000, 5_000), BookingStatus::Pending);
    }

    #[test]
    fn waitlist_is_fifo_by_creation() {
        let mut p = pool();
        let late = booking(&p, BookingKind::Reservation, BookingStatus::Pending, 20);
        let early = booking(&p, BookingKind::Reservation, BookingStatus::Pending, 10);
        let seat = booking(&p, BookingKind::Seat, BookingStatus::Confirmed, 5);
        p.bookings = vec![seat, late.clone(), early.clone()];

        let order: Vec<Ulid> = p.waitlist().iter().map(|b| b.id).collect();
        assert_eq!(order, vec![early.id, late.id]);
        assert_eq!(p.next_in_waitlist(), Some(early.id));
    }

    #[test]
    fn audit_flags_desync_and_overbooking() {
        let mut p = pool();
        p.bookings.push(booking(&p, BookingKind::Seat, BookingStatus::Confirmed, 1));
        p.occupied_cached = 1;
        assert!(AuditReport::of(&p).is_consistent());

        p.occupied_cached = 0;
        let report = AuditReport::of(&p);
        assert_eq!(report.drift, -1);
        assert_eq!(report.finding, Some(Inconsistency::Desync { drift: -1 }));

        p.occupied_cached = 3;
        let report = AuditReport::of(&p);
        assert_eq!(report.drift, 2);
        assert_eq!(
            report.finding,
            Some(Inconsistency::Overbooked { occupied: 3, capacity: 2 })
        );
    }

    #[test]
    fn active_booking_lookup_ignores_cancelled() {
        let mut p = pool();
        let mut b = booking(&p, BookingKind::Seat, BookingStatus::Cancelled, 1);
        let worker = b.worker_id;
        b.cancelled_at = Some(2);
        p.bookings.push(b);
        assert!(p.active_booking_for(&worker).is_none());
    }

    #[test]
    fn default_config_offset_is_valid() {
        let cfg = TenantConfig::default();
        assert_eq!(cfg.utc_offset().unwrap().local_minus_utc(), -3 * 3600);

        let broken = TenantConfig { utc_offset_minutes: 24 * 60 + 1, ..TenantConfig::default() };
        assert!(broken.utc_offset().is_none());
    }
}
