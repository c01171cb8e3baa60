use ulid::Ulid;

use crate::policy::CancelRefusal;

/// Expected outcomes of a booking attempt that did not produce a booking.
/// The message of each variant is stable and shown to workers verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    PoolUnavailable,
    NotYetReleased(String),
    ShiftAlreadyStarted,
    AlreadyBooked,
    Full,
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::PoolUnavailable => "pool_unavailable",
            Rejection::NotYetReleased(_) => "not_yet_released",
            Rejection::ShiftAlreadyStarted => "shift_already_started",
            Rejection::AlreadyBooked => "already_booked",
            Rejection::Full => "full",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::PoolUnavailable => write!(f, "pool unavailable"),
            Rejection::NotYetReleased(reason) => write!(f, "not yet released: {reason}"),
            Rejection::ShiftAlreadyStarted => write!(f, "shift already started"),
            Rejection::AlreadyBooked => write!(f, "already booked on this pool"),
            Rejection::Full => write!(f, "pool is full"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Rejected(Rejection),
    CancelRefused(CancelRefusal),
    /// The pool (or, with `None`, the tenant's commit gate) could not be
    /// locked in time. Retryable.
    ConcurrencyConflict(Option<Ulid>),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Another pool already covers this date + shift + region.
    SlotTaken(Ulid),
    CapacityBelowOccupied { requested: u32, occupied: u32 },
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict(_))
    }
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Rejected(r)
    }
}

impl From<CancelRefusal> for EngineError {
    fn from(r: CancelRefusal) -> Self {
        EngineError::CancelRefused(r)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rejected(r) => write!(f, "{r}"),
            EngineError::CancelRefused(r) => write!(f, "cannot cancel: {r}"),
            EngineError::ConcurrencyConflict(Some(id)) => {
                write!(f, "pool {id} is busy, retry later")
            }
            EngineError::ConcurrencyConflict(None) => write!(f, "tenant is busy, retry later"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotTaken(id) => {
                write!(f, "pool {id} already exists for this date, shift and region")
            }
            EngineError::CapacityBelowOccupied { requested, occupied } => write!(
                f,
                "capacity {requested} is below the {occupied} confirmed seats"
            ),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
