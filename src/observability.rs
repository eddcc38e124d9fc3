use std::net::SocketAddr;

use crate::engine::Action;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "barbercal_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "barbercal_query_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: refused overlaps. Labels: layer (`precheck` or `exclusion`), occupant.
pub const CONFLICTS_TOTAL: &str = "barbercal_conflicts_total";

/// Counter: applied lifecycle transitions. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "barbercal_transitions_total";

/// Counter: mutations rejected by the lifecycle table. Labels: action.
pub const ILLEGAL_TRANSITIONS_TOTAL: &str = "barbercal_illegal_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "barbercal_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "barbercal_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "barbercal_connections_rejected_total";

/// Gauge: barbers loaded in the engine.
pub const BARBERS_LOADED: &str = "barbercal_barbers_loaded";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "barbercal_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "barbercal_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "barbercal_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateBooking(_) => "create_booking_safe",
        Command::UpdateBooking(_) => "update_booking_safe",
        Command::Transition { action, .. } => match action {
            Action::Start => "start_booking",
            Action::Complete => "complete_booking",
            Action::Cancel => "cancel_booking",
            _ => "transition_booking",
        },
        Command::DeleteBooking { .. } => "delete_booking_safe",
        Command::CreateUnavailability { .. } => "create_unavailability_safe",
        Command::DeleteUnavailability { .. } => "delete_unavailability",
        Command::CreateBarber { .. } => "create_barber",
        Command::SetBarberActive { .. } => "set_barber_active",
        Command::DeleteBarber { .. } => "delete_barber_safe",
        Command::DeleteService { .. } => "delete_service_safe",
        Command::CreateService { .. } => "create_service",
        Command::UpdateService { .. } => "update_service",
        Command::UpdateSettings { .. } => "update_business_settings",
        Command::CheckConflict { .. } => "check_conflict",
        Command::SelectBarbers { .. } => "select_barbers",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectUnavailability { .. } => "select_unavailability",
        Command::SelectServices { .. } => "select_services",
        Command::SelectSettings => "select_business_settings",
        Command::Listen { .. } => "listen",
    }
}
