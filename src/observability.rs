use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotd_bookings_created_total";

/// Counter: booking writes rejected because the interval was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "slotd_booking_conflicts_total";

// ── Automation ──────────────────────────────────────────────────

/// Counter: completed automation cycles.
pub const AUTOMATION_CYCLES_TOTAL: &str = "slotd_automation_cycles_total";

/// Histogram: automation cycle duration in seconds.
pub const AUTOMATION_CYCLE_DURATION_SECONDS: &str = "slotd_automation_cycle_duration_seconds";

/// Counter: scheduler ticks dropped because a cycle was still running.
pub const AUTOMATION_SKIPPED_TICKS_TOTAL: &str = "slotd_automation_skipped_ticks_total";

/// Counter: reminders dispatched and recorded. Labels: kind.
pub const REMINDERS_SENT_TOTAL: &str = "slotd_reminders_sent_total";

/// Counter: reminder dispatch failures. Labels: action.
pub const DISPATCH_FAILURES_TOTAL: &str = "slotd_dispatch_failures_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::SetAvailability { .. } => "set_availability",
        Command::DefineService { .. } => "define_service",
        Command::DefineFormTemplate { .. } => "define_form_template",
        Command::UpsertContact { .. } => "upsert_contact",
        Command::SetPause { .. } => "set_pause",
        Command::UpdateSettings { .. } => "update_settings",
        Command::InsertBooking { .. } => "insert_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::InsertForm { .. } => "insert_form",
        Command::CompleteForm { .. } => "complete_form",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlotCheck { .. } => "select_slot_check",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectForms { .. } => "select_forms",
    }
}
