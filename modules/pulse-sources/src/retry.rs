use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use pulse_common::{Result, RetryConfig};

/// Bounded exponential backoff with jitter, composed around every adapter request.
///
/// Only transient failures are retried. Anything else returns on first sight.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay added as uniform random jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// No waiting, `attempts` tries. For tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.jittered(self.delay_for(attempt));
                    warn!(
                        request = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(request = label, attempts = attempt, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::{IngestError, SourceId};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            jitter: 0.0,
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(250));
        assert_eq!(p.delay_for(40), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..50 {
            let d = p.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let src = SourceId::new("reddit");
        let out = policy()
            .run("search", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(IngestError::transient(&src, Some(503), "unavailable"))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let src = SourceId::new("cfpb");
        let err = policy()
            .run("page", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::transient(&src, Some(429), "slow down"))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let src = SourceId::new("glassdoor");
        let err = policy()
            .run("reviews", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IngestError::Auth {
                    source_id: src.clone(),
                    message: "401".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
