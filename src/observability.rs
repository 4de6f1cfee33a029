use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotgrid_queries_total";

/// Histogram: wire statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotgrid_query_duration_seconds";

/// Counter: engine operations. Labels: op, outcome.
pub const OPERATIONS_TOTAL: &str = "slotgrid_operations_total";

/// Histogram: engine operation latency in seconds, retries included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "slotgrid_operation_duration_seconds";

/// Counter: commits lost to a concurrent writer. Labels: op.
pub const TRANSACTION_CONFLICTS_TOTAL: &str = "slotgrid_transaction_conflicts_total";

/// Counter: occupancy entries dropped because their reservation was gone.
pub const DANGLING_REPAIRED_TOTAL: &str = "slotgrid_dangling_repaired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotgrid_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotgrid_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotgrid_connections_rejected_total";

/// Counter: logins refused before the password check.
pub const AUTH_FAILURES_TOTAL: &str = "slotgrid_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotgrid_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotgrid_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotgrid_wal_compactions_total";

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
        Command::Place { .. } => "place",
        Command::Move { .. } => "move",
        Command::Delete { .. } => "delete",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectSlots => "select_slots",
        Command::SelectCourses => "select_courses",
    }
}
