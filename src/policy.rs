//! Cancellation policy: whether a booking may still be cancelled at `now`.

use crate::model::{Booking, HOUR_MS, Ms, TenantConfig};

/// Why a cancellation was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelRefusal {
    /// The tenant does not allow workers to cancel.
    Disabled,
    /// Only pending or confirmed bookings can be cancelled.
    NotActive,
    /// Too close to the shift start.
    TooLate { hours_until_shift: f64, lead_hours: f64 },
}

impl std::fmt::Display for CancelRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelRefusal::Disabled => write!(f, "cancellation is disabled"),
            CancelRefusal::NotActive => write!(f, "booking is no longer active"),
            CancelRefusal::TooLate { hours_until_shift, lead_hours } => write!(
                f,
                "cancellation closes {lead_hours}h before the shift ({hours_until_shift:.2}h left)"
            ),
        }
    }
}

/// Check every cancellation rule in order; `shift_start` is the absolute
/// start instant of the booking's pool.
pub fn check_cancel(
    booking: &Booking,
    shift_start: Ms,
    config: &TenantConfig,
    now: Ms,
) -> Result<(), CancelRefusal> {
    if !config.cancellation_enabled {
        return Err(CancelRefusal::Disabled);
    }
    if !booking.is_active() {
        return Err(CancelRefusal::NotActive);
    }
    let hours_until_shift = (shift_start - now) as f64 / HOUR_MS as f64;
    if hours_until_shift < config.cancellation_lead_hours {
        return Err(CancelRefusal::TooLate {
            hours_until_shift,
            lead_hours: config.cancellation_lead_hours,
        });
    }
    Ok(())
}

pub fn can_cancel(booking: &Booking, shift_start: Ms, config: &TenantConfig, now: Ms) -> bool {
    check_cancel(booking, shift_start, config, now).is_ok()
}
