//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{keyed::DashMapStateStore, InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Keyed limiter, one bucket per avatar id
pub type AvatarLimiter = RateLimiter<i64, DashMapStateStore<i64>, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Input rate limiter for WebSocket messages (per connection)
pub const INPUT_RATE_LIMIT: u32 = 30; // Max 30 input messages per second

/// Movement commands accepted per avatar per second
pub const MOVE_RATE_LIMIT: u32 = 10;

/// Idle move buckets are dropped once every this many checks
const PRUNE_EVERY_CHECKS: u64 = 1024;

/// Per-connection rate limiter state
#[derive(Clone)]
pub struct PlayerRateLimiter {
    input_limiter: Arc<Limiter>,
}

impl PlayerRateLimiter {
    pub fn new() -> Self {
        Self {
            input_limiter: create_limiter(INPUT_RATE_LIMIT),
        }
    }

    /// Check if an input message is allowed (returns true if allowed)
    pub fn check_input(&self) -> bool {
        self.input_limiter.check().is_ok()
    }
}

impl Default for PlayerRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Movement throttle shared by every connection of this process.
///
/// No burst: two moves for the same avatar must be at least
/// `1 / MOVE_RATE_LIMIT` seconds apart.
#[derive(Clone)]
pub struct MoveThrottle {
    limiter: Arc<AvatarLimiter>,
    checks: Arc<AtomicU64>,
}

impl MoveThrottle {
    pub fn new(per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::dashmap(quota)),
            checks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn check(&self, avatar_id: i64) -> bool {
        let allowed = self.limiter.check_key(&avatar_id).is_ok();
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY_CHECKS == 0 {
            self.prune();
        }
        allowed
    }

    /// Forgets avatars whose bucket has fully refilled
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    /// Avatars currently holding a bucket
    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }
}

impl Default for MoveThrottle {
    fn default() -> Self {
        Self::new(MOVE_RATE_LIMIT)
    }
}
