use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "teamslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "teamslot_query_duration_seconds";

/// Histogram: slot resolution latency in seconds, calendar lookups included.
pub const SLOT_RESOLUTION_DURATION_SECONDS: &str = "teamslot_slot_resolution_duration_seconds";

// ── Calendar providers ──────────────────────────────────────────

/// Histogram: one calendar's busy lookup in seconds.
pub const PROVIDER_FETCH_DURATION_SECONDS: &str = "teamslot_provider_fetch_duration_seconds";

/// Counter: busy lookups that failed or timed out and were treated as free.
pub const PROVIDER_FAILURES_TOTAL: &str = "teamslot_provider_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "teamslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "teamslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "teamslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "teamslot_tenants_active";

/// Counter: pending requests expired by the reaper.
pub const REQUESTS_EXPIRED_TOTAL: &str = "teamslot_requests_expired_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "teamslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "teamslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::SetSchedule { .. } => "set_schedule",
        Command::ClearSchedule { .. } => "clear_schedule",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::InsertMember { .. } => "insert_member",
        Command::DeleteMember { .. } => "delete_member",
        Command::SelectMembers { .. } => "select_members",
        Command::InsertRequest { .. } => "insert_request",
        Command::ApproveRequest { .. } => "approve_request",
        Command::DeclineRequest { .. } => "decline_request",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectSlots { .. } => "select_slots",
        Command::SetCredential { .. } => "set_credential",
        Command::DeleteCredential { .. } => "delete_credential",
    }
}
