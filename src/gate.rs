//! Same-day release gate.
//!
//! Pools dated today (tenant-local) are released to workers in tiers: each
//! rating tier has a time of day from which it may see and book them. Pools on
//! any other date are never gated. Everything here is a pure function of its
//! inputs; callers pass `now` explicitly.

use chrono::{FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Timelike, Utc};

use crate::model::{DEFAULT_RELEASE_TIMES, TenantConfig};

/// Tier whose threshold applies to unknown or out-of-range tiers.
pub const FALLBACK_TIER: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GateDecision {
    fn allow(reason: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into() }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: reason.into() }
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_release_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

fn tier_index(tier: u8) -> usize {
    let tier = if (1..=5).contains(&tier) { tier } else { FALLBACK_TIER };
    usize::from(tier - 1)
}

/// The release threshold for `tier`. Unknown tiers use the tier-3 threshold;
/// a malformed configured value falls back to the built-in default for that
/// slot. The defect itself is reported by [`report_defects`].
pub fn release_threshold(config: &TenantConfig, tier: u8) -> NaiveTime {
    let idx = tier_index(tier);
    parse_release_time(&config.release_times[idx])
        .or_else(|| parse_release_time(DEFAULT_RELEASE_TIMES[idx]))
        .unwrap_or(NaiveTime::MIN)
}

/// The tenant's UTC offset; an out-of-range value degrades to UTC.
pub fn tenant_offset(config: &TenantConfig) -> FixedOffset {
    config.utc_offset().unwrap_or_else(|| Utc.fix())
}

/// Log and count every malformed field of `config`, returning how many there
/// are. Runs when a configuration is committed or replayed, not on each
/// evaluation.
pub fn report_defects(config: &TenantConfig) -> usize {
    let mut defects = 0;
    for (idx, raw) in config.release_times.iter().enumerate() {
        if parse_release_time(raw).is_none() {
            tracing::warn!(
                tier = idx + 1,
                configured = %raw,
                fallback = DEFAULT_RELEASE_TIMES[idx],
                "config defect: malformed release time, using default"
            );
            metrics::counter!(crate::observability::CONFIG_DEFECTS_TOTAL, "field" => "release_time")
                .increment(1);
            defects += 1;
        }
    }
    if config.utc_offset().is_none() {
        tracing::warn!(
            configured = config.utc_offset_minutes,
            "config defect: invalid utc offset, using UTC"
        );
        metrics::counter!(crate::observability::CONFIG_DEFECTS_TOTAL, "field" => "utc_offset")
            .increment(1);
        defects += 1;
    }
    defects
}

/// Whether a worker of `tier` may see a pool on `pool_date` at local time
/// `now_local`. Comparison is at whole-second granularity.
pub fn can_view(
    config: &TenantConfig,
    tier: u8,
    pool_date: NaiveDate,
    now_local: NaiveDateTime,
) -> GateDecision {
    if !config.release_enabled {
        return GateDecision::allow("release schedule disabled");
    }
    if pool_date != now_local.date() {
        return GateDecision::allow("not a same-day pool");
    }

    let threshold = release_threshold(config, tier);
    let now_time = now_local.time().with_nanosecond(0).unwrap_or(now_local.time());
    if now_time >= threshold {
        GateDecision::allow(format!("released at {threshold}"))
    } else {
        let shown = if (1..=5).contains(&tier) { tier } else { FALLBACK_TIER };
        GateDecision::deny(format!("same-day shifts open for {shown}-star workers at {threshold}"))
    }
}
