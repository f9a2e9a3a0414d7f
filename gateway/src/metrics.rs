//! Pipeline-specific Prometheus metrics, layered on top of
//! `aislink_common::metrics`'s recorder install and HTTP server.

use metrics::{counter, gauge, histogram};

/// Record an accepted position report.
pub fn position_ingested() {
    counter!("aislink_positions_ingested_total").increment(1);
}

/// Record a position report dropped by validation (missing/invalid MMSI or
/// out-of-range coordinates).
pub fn position_dropped() {
    counter!("aislink_positions_dropped_total").increment(1);
}

/// Record a completed dispatcher flush tick's duration.
pub fn dispatch_tick_duration(duration_secs: f64) {
    histogram!("aislink_dispatch_tick_duration_seconds").record(duration_secs);
}

/// Set the number of distinct tiles with at least one live subscriber.
pub fn subscribed_tile_count(count: usize) {
    gauge!("aislink_subscribed_tiles").set(count as f64);
}

/// Set the number of currently connected downstream sessions.
pub fn session_count(count: usize) {
    gauge!("aislink_sessions").set(count as f64);
}

/// Record a message dropped from a session's outbound queue under overflow.
pub fn outbox_dropped() {
    counter!("aislink_outbox_dropped_total").increment(1);
}

/// Record a session closed by the heartbeat sweep for an unanswered ping.
pub fn heartbeat_timeout() {
    counter!("aislink_heartbeat_timeouts_total").increment(1);
}

/// Record a batch-sync tick's outcome.
pub fn batch_sync_tick(scanned: usize, upserted: usize, errors: usize, duration_ms: u64) {
    counter!("aislink_batch_sync_scanned_total").increment(scanned as u64);
    counter!("aislink_batch_sync_upserted_total").increment(upserted as u64);
    counter!("aislink_batch_sync_errors_total").increment(errors as u64);
    histogram!("aislink_batch_sync_duration_ms").record(duration_ms as f64);
}

/// Set the number of vessels currently live in the in-memory store.
pub fn live_vessel_count(count: usize) {
    gauge!("aislink_live_vessels").set(count as f64);
}
