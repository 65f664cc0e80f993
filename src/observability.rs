use std::net::SocketAddr;

use crate::wire::Request;

// ── Engine metrics ───────────────────────────────────────────────

/// Counter: availability checks. Labels: result (available, conflict).
pub const AVAILABILITY_CHECKS_TOTAL: &str = "salon_availability_checks_total";

/// Counter: commit attempts. Labels: outcome.
pub const COMMITS_TOTAL: &str = "salon_commits_total";

/// Histogram: commit protocol latency in seconds (re-check + insert).
pub const COMMIT_DURATION_SECONDS: &str = "salon_commit_duration_seconds";

/// Counter: occupancy source queries that failed. Labels: source.
pub const AGGREGATION_FAILURES_TOTAL: &str = "salon_aggregation_failures_total";

// ── Reconciler metrics ───────────────────────────────────────────

/// Counter: guest booking replays. Labels: outcome.
pub const REPLAYS_TOTAL: &str = "salon_replays_total";

/// Counter: stashes that replaced an earlier stashed intent.
pub const STASH_OVERWRITES_TOTAL: &str = "salon_stash_overwrites_total";

/// Counter: expired stashes discarded by the reaper.
pub const STASHES_REAPED_TOTAL: &str = "salon_stashes_reaped_total";

// ── Side effects ─────────────────────────────────────────────────

/// Counter: notification deliveries that failed or were skipped.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "salon_notifications_failed_total";

/// Counter: loyalty visits the ledger refused.
pub const LOYALTY_FAILURES_TOTAL: &str = "salon_loyalty_failures_total";

// ── Gateway ──────────────────────────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "salon_requests_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a request to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::CheckAvailability { .. } => "check_availability",
        Request::CheckAnyAvailability { .. } => "check_any_availability",
        Request::Slots { .. } => "slots",
        Request::StartBooking { .. } => "start_booking",
        Request::Advance { .. } => "advance",
        Request::Back { .. } => "back",
        Request::Commit { .. } => "commit",
        Request::Stash { .. } => "stash",
        Request::Replay { .. } => "replay",
        Request::DiscardStash { .. } => "discard_stash",
        Request::BlockTime { .. } => "block_time",
        Request::SetStatus { .. } => "set_status",
        Request::Reschedule { .. } => "reschedule",
    }
}
