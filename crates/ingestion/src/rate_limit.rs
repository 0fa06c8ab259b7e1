//! Client-side quota pacing for registry API calls

use crate::{IngestionError, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

/// Token-bucket limiter sized to the registry's published quota.
///
/// Permits replenish evenly across the window (`window / max_requests` per
/// cell) so a run paces itself instead of bursting into the server-side
/// limit and eating 429 cooldowns.
pub struct ApiRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_requests: u32,
    window: Duration,
}

impl ApiRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Result<Self> {
        let burst = NonZeroU32::new(max_requests).ok_or_else(|| {
            IngestionError::Source("rate limit quota must be at least 1".into())
        })?;
        let period = (window / max_requests).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(nonzero!(1u32)))
            .allow_burst(burst);

        debug!(max_requests, window_secs = window.as_secs(), "rate limiter ready");

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            max_requests,
            window,
        })
    }

    /// Wait until a permit is available. Jitter spreads concurrent waiters
    /// so they do not all wake on the same replenish tick.
    pub async fn acquire(&self) {
        self.limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(100)))
            .await;
    }

    /// Non-blocking permit check, used by tests and health probes.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
