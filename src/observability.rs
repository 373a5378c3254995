use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reserve attempts. Labels: outcome (placed, capacity_exhausted, invalid_date, rejected).
pub const RESERVATIONS_TOTAL: &str = "slotwise_reservations_total";

/// Counter: reservations confirmed against an order.
pub const CONFIRMATIONS_TOTAL: &str = "slotwise_confirmations_total";

/// Counter: reservations released by a caller (no-op releases excluded).
pub const RELEASES_TOTAL: &str = "slotwise_releases_total";

/// Counter: holds expired by the sweep.
pub const SWEEP_EXPIRED_TOTAL: &str = "slotwise_sweep_expired_total";

/// Counter: sweep passes that failed.
pub const SWEEP_FAILURES_TOTAL: &str = "slotwise_sweep_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Gauge: number of slots currently in the store.
pub const SLOTS_ACTIVE: &str = "slotwise_slots_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::SelectSlots { .. } => "select_slots",
        Command::Reserve { .. } => "reserve",
        Command::Confirm { .. } => "confirm",
        Command::Release { .. } => "release",
        Command::ReleaseExpired => "release_expired",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectDeliveryDates { .. } => "select_delivery_dates",
        Command::SelectShipDate { .. } => "select_ship_date",
        Command::SelectQualifyingRates { .. } => "select_qualifying_rates",
    }
}
