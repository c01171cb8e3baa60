use std::net::SocketAddr;

use crate::sql::Command;

// ── Requests ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agendad_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agendad_query_duration_seconds";

// ── Booking domain ───────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (seat, reservation, or a rejection label).
pub const BOOKINGS_TOTAL: &str = "agendad_bookings_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "agendad_cancellations_total";

/// Counter: reservations promoted to seats.
pub const PROMOTIONS_TOTAL: &str = "agendad_promotions_total";

/// Counter: inconsistent pools seen by audits. Labels: kind (overbooked, desync).
pub const INCONSISTENCIES_TOTAL: &str = "agendad_inconsistencies_total";

/// Counter: occupancy counters rewritten by reconciliation.
pub const RECONCILE_CORRECTIONS_TOTAL: &str = "agendad_reconcile_corrections_total";

/// Counter: pool locks not acquired within the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "agendad_lock_timeouts_total";

/// Counter: malformed tenant settings replaced by defaults. Labels: field.
pub const CONFIG_DEFECTS_TOTAL: &str = "agendad_config_defects_total";

// ── Resources ────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "agendad_connections_active";
pub const CONNECTIONS_TOTAL: &str = "agendad_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agendad_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "agendad_tenants_active";

pub const AUTH_FAILURES_TOTAL: &str = "agendad_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agendad_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "agendad_wal_flush_batch_size";

pub const COMPACTIONS_TOTAL: &str = "agendad_compactions_total";

/// Install the Prometheus exporter when a port is configured.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPool { .. } => "insert_pool",
        Command::UpdatePool { .. } => "update_pool",
        Command::DuplicatePool { .. } => "duplicate_pool",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::UpsertWorker { .. } => "upsert_worker",
        Command::UpdateConfig { .. } => "update_config",
        Command::SelectPools { .. } => "select_pools",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectVisiblePools { .. } => "select_visible_pools",
        Command::SelectAudit { .. } => "select_audit",
        Command::Reconcile { .. } => "reconcile",
        Command::SelectConfig => "select_config",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
