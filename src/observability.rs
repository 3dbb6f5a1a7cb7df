use std::net::SocketAddr;

// ── Request-driven metrics ──────────────────────────────────────

/// Counter: state-machine operations. Labels: operation, outcome.
pub const ALLOCATIONS_TOTAL: &str = "spotwise_allocations_total";

/// Counter: compare-and-swap retries on the allocation path.
pub const ALLOCATION_RETRIES_TOTAL: &str = "spotwise_allocation_retries_total";

/// Counter: exits confirmed by a user other than the one who entered.
pub const EXIT_OWNER_MISMATCH_TOTAL: &str = "spotwise_exit_owner_mismatch_total";

// ── Background processes ────────────────────────────────────────

/// Counter: unconfirmed bookings released by the reaper.
pub const RECLAIMED_BOOKINGS_TOTAL: &str = "spotwise_reclaimed_bookings_total";

/// Counter: stays closed by the estimator after exceeding max occupation.
pub const ABANDONED_STAYS_TOTAL: &str = "spotwise_abandoned_stays_total";

/// Counter: manual blocks that expired on their own.
pub const EXPIRED_BLOCKS_TOTAL: &str = "spotwise_expired_blocks_total";

/// Counter: background ticks abandoned on error. Labels: process.
pub const TICK_FAILURES_TOTAL: &str = "spotwise_tick_failures_total";

/// Histogram: background tick duration in seconds. Labels: process.
pub const TICK_DURATION_SECONDS: &str = "spotwise_tick_duration_seconds";

/// Gauge: spots currently free, as seen by the last estimator tick.
pub const SPOTS_FREE: &str = "spotwise_spots_free";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotwise_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
