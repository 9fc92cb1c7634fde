//! Time utilities for match bookkeeping

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Get current Unix timestamp in seconds (store entry bookkeeping)
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Simulated time advanced by one engine tick (seconds)
pub const TICK_DELTA_SECS: f64 = 1.0;

/// Returns true once `created_at + ttl` lies strictly in the past.
/// A zero TTL never expires.
pub fn is_expired(created_at_secs: u64, ttl_secs: u64, now_secs: u64) -> bool {
    ttl_secs > 0 && now_secs > created_at_secs.saturating_add(ttl_secs)
}
