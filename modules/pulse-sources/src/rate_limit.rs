//! Per-source outbound request limiting.
//!
//! Sources publish a requests-per-minute ceiling. Requests are spaced evenly
//! at `60s / n` with no burst allowance, so no rolling 60-second window ever
//! sees more than the configured count, whatever the origin server enforces.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use pulse_common::{IngestError, Result};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

pub struct SourceRateLimiter {
    limiter: DirectLimiter,
    per_minute: u32,
}

impl SourceRateLimiter {
    pub fn per_minute(requests_per_minute: u32) -> Result<Self> {
        let per_minute = NonZeroU32::new(requests_per_minute).ok_or_else(|| {
            IngestError::Config("requests_per_minute must be greater than zero".to_string())
        })?;
        let period = Duration::from_secs(60) / per_minute.get();
        let quota = Quota::with_period(period)
            .ok_or_else(|| IngestError::Config(format!("invalid rate limit period {period:?}")))?
            .allow_burst(NonZeroU32::MIN);
        Ok(Self {
            limiter: RateLimiter::direct(quota),
            per_minute: per_minute.get(),
        })
    }

    /// Wait until one request may be sent. Returns `true` when the caller had
    /// to wait for the next slot.
    pub async fn acquire(&self) -> bool {
        if self.try_acquire() {
            return false;
        }
        self.limiter.until_ready().await;
        true
    }

    /// Take a permit without waiting. `false` when the caller would exceed the rate.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl std::fmt::Debug for SourceRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}
