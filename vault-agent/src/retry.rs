//! Bounded exponential backoff with jitter for transient submission failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use vault_common::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomized in either direction
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E, R = String> {
    /// The error was not transient
    Fatal(E),
    /// Every attempt failed transiently
    Exhausted { last: E, attempts: u32 },
    /// A pre-retry check asked to stop
    Cancelled { last: E, reason: R },
}

impl<E, R> RetryError<E, R> {
    pub fn last_error(&self) -> &E {
        match self {
            Self::Fatal(e) => e,
            Self::Exhausted { last, .. } => last,
            Self::Cancelled { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, exhausts the policy, or
/// `cancel` returns a reason before a retry.
pub async fn retry_transient<F, Fut, T, E, C, CFut, R>(
    policy: &RetryPolicy,
    mut op: F,
    is_transient: impl Fn(&E) -> bool,
    mut cancel: C,
) -> Result<T, RetryError<E, R>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = Option<R>>,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !is_transient(&err) {
            return Err(RetryError::Fatal(err));
        }
        if attempt >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                last: err,
                attempts: attempt,
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Transient failure, backing off");
        sleep(delay).await;

        if let Some(reason) = cancel().await {
            return Err(RetryError::Cancelled { last: err, reason });
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        };
        for _ in 0..100 {
            let d = policy.delay_for(1).as_millis();
            assert!((800..=1200).contains(&d), "delay {d} out of band");
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, RetryError<&str>> = retry_transient(
            &fast(4),
            |_| {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move { if n < 2 { Err("timeout") } else { Ok(7) } }
            },
            |_| true,
            || async { None },
        )
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry_transient(
            &fast(4),
            |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err("rejected") }
            },
            |_| false,
            || async { None::<String> },
        )
        .await;
        assert!(matches!(res, Err(RetryError::Fatal("rejected"))));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let res: Result<(), _> = retry_transient(
            &fast(3),
            |_| async { Err("timeout") },
            |_| true,
            || async { None::<String> },
        )
        .await;
        assert!(matches!(res, Err(RetryError::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_cancel_stops_before_retry() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = retry_transient(
            &fast(5),
            |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err("timeout") }
            },
            |_| true,
            || async { Some("agent revoked".to_string()) },
        )
        .await;
        match res {
            Err(RetryError::Cancelled { reason, .. }) => assert_eq!(reason, "agent revoked"),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }
}
