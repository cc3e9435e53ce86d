use std::net::SocketAddr;

use crate::model::Event;

// ── Allocation metrics ──────────────────────────────────────────

/// Counter: case numbers handed out. Labels: origin (direct, reservation, finalized).
pub const ALLOCATIONS_TOTAL: &str = "officeno_allocations_total";

/// Counter: user commits. Labels: status (allocated, resaved, error).
pub const COMMITS_TOTAL: &str = "officeno_commits_total";

/// Counter: conditional inserts that lost to a concurrent writer.
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "officeno_allocation_conflicts_total";

/// Counter: cases written by the daily sweep.
pub const FINALIZED_TOTAL: &str = "officeno_finalized_total";

/// Counter: sweep runs. Labels: status (ok, partial, error).
pub const SWEEPS_TOTAL: &str = "officeno_sweeps_total";

/// Counter: events applied. Labels: event.
pub const EVENTS_TOTAL: &str = "officeno_events_total";

// ── WAL metrics ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "officeno_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "officeno_wal_flush_batch_size";

/// Counter: compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "officeno_wal_compactions_total";

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

/// Map an Event variant to a short label for metrics.
pub fn event_label(event: &Event) -> &'static str {
    match event {
        Event::CasesCreated { .. } => "cases_created",
        Event::CaseUpdated { .. } => "case_updated",
        Event::CaseDeleted { .. } => "case_deleted",
        Event::ReservationSaved { .. } => "reservation_saved",
        Event::ReservationCommitted { .. } => "reservation_committed",
        Event::ReservationMirrored { .. } => "reservation_mirrored",
        Event::SweepCompleted { .. } => "sweep_completed",
    }
}
