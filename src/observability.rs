use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spacebook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spacebook_query_duration_seconds";

/// Counter: reservation writes refused by a booking rule. Labels: reason, op.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "spacebook_reservations_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spacebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spacebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spacebook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spacebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spacebook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSpace { .. } => "insert_space",
        Command::UpdateSpace { .. } => "update_space",
        Command::DeleteSpace { .. } => "delete_space",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectSpaces { .. } => "select_spaces",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}
