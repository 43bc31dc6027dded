//! Global circuit breaker for automated submissions.
//!
//! Unlike a per-service breaker this one never half-opens on its own: once
//! the failure fraction in the rolling window exceeds the threshold, every
//! submission for every account halts until an operator clears it.
//!
//! # States
//!
//! ```text
//! ┌─────────┐  failures / samples > fraction  ┌─────────┐
//! │ CLOSED  │ ───────────────────────────────►│ TRIPPED │
//! │(normal) │  (with samples >= min_samples)  │(halted) │
//! └─────────┘                                 └─────────┘
//!      ▲                                           │
//!      └──────────────── manual clear ─────────────┘
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use vault_common::BreakerConfig;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure fraction that trips the breaker when exceeded
    pub failure_fraction: f64,
    /// Rolling window over which outcomes are counted
    pub window: Duration,
    /// Outcomes required before the fraction is evaluated
    pub min_samples: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_fraction: config.failure_fraction,
            window: Duration::from_secs(config.window_secs),
            min_samples: config.min_samples.max(1),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure fraction
    pub fn failure_fraction(mut self, fraction: f64) -> Self {
        self.failure_fraction = fraction;
        self
    }

    /// Set the rolling window
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the minimum sample count
    pub fn min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples.max(1);
        self
    }
}

// ============================================================================
// Persisted State
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub tripped: bool,
    pub reason: Option<String>,
    pub tripped_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Circuit Breaker Implementation
// ============================================================================

#[derive(Debug, Default)]
struct Window {
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
    state: CircuitBreakerState,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    tripped: AtomicBool,
    /// Set on trip, consumed by the first `take_alert`
    alert_pending: AtomicBool,
    window: Mutex<Window>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            tripped: AtomicBool::new(false),
            alert_pending: AtomicBool::new(false),
            window: Mutex::new(Window::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        // Window data stays consistent even if a holder panicked
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn record_success(&self) {
        self.record_at(Utc::now(), true, None);
    }

    /// Record a failed submission. Returns `true` if this failure tripped
    /// the breaker.
    pub fn record_failure(&self, reason: impl Into<String>) -> bool {
        self.record_at(Utc::now(), false, Some(reason.into()))
    }

    fn record_at(&self, now: DateTime<Utc>, success: bool, reason: Option<String>) -> bool {
        let mut window = self.lock();
        window.outcomes.push_back((now, success));
        Self::prune(&mut window, now, self.config.window);

        if window.state.tripped {
            return false;
        }

        let samples = window.outcomes.len();
        let failures = window.outcomes.iter().filter(|(_, ok)| !ok).count();
        let fraction = failures as f64 / samples as f64;
        tracing::trace!(samples, failures, fraction, "Circuit breaker recorded outcome");

        if samples >= self.config.min_samples && fraction > self.config.failure_fraction {
            let reason = format!(
                "{} of {} submissions failed ({:.0}% > {:.0}%){}",
                failures,
                samples,
                fraction * 100.0,
                self.config.failure_fraction * 100.0,
                reason.map(|r| format!(", last: {r}")).unwrap_or_default(),
            );
            window.state = CircuitBreakerState {
                tripped: true,
                reason: Some(reason.clone()),
                tripped_at: Some(now),
            };
            self.tripped.store(true, Ordering::Release);
            self.alert_pending.store(true, Ordering::Release);
            tracing::warn!(failures, samples, reason = %reason, "Circuit breaker TRIPPED");
            return true;
        }
        false
    }

    fn prune(window: &mut Window, now: DateTime<Utc>, span: Duration) {
        let span = ChronoDuration::from_std(span).unwrap_or(ChronoDuration::MAX);
        let cutoff = now.checked_sub_signed(span).unwrap_or(DateTime::<Utc>::MIN_UTC);
        while window.outcomes.front().is_some_and(|(at, _)| *at < cutoff) {
            window.outcomes.pop_front();
        }
    }

    /// Manually clear a trip and forget the window.
    pub fn clear(&self) {
        let mut window = self.lock();
        window.outcomes.clear();
        window.state = CircuitBreakerState::default();
        self.tripped.store(false, Ordering::Release);
        self.alert_pending.store(false, Ordering::Release);
        tracing::info!("Circuit breaker manually cleared");
    }

    /// Restore persisted state after a restart.
    pub fn restore(&self, state: CircuitBreakerState) {
        let mut window = self.lock();
        self.tripped.store(state.tripped, Ordering::Release);
        self.alert_pending.store(state.tripped, Ordering::Release);
        if state.tripped {
            tracing::warn!(reason = ?state.reason, "Circuit breaker restored in TRIPPED state");
        }
        window.state = state;
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.lock().state.clone()
    }

    /// Returns `true` exactly once per trip.
    pub fn take_alert(&self) -> bool {
        self.alert_pending.swap(false, Ordering::AcqRel)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut window = self.lock();
        Self::prune(&mut window, Utc::now(), self.config.window);
        let samples = window.outcomes.len();
        let failures = window.outcomes.iter().filter(|(_, ok)| !ok).count();
        CircuitBreakerStats {
            tripped: window.state.tripped,
            samples,
            failures,
            failure_fraction: self.config.failure_fraction,
            min_samples: self.config.min_samples,
            window_secs: self.config.window.as_secs(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub tripped: bool,
    /// Outcomes currently in the window
    pub samples: usize,
    pub failures: usize,
    /// Configured trip threshold
    pub failure_fraction: f64,
    pub min_samples: usize,
    pub window_secs: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(min_samples: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .failure_fraction(0.5)
                .min_samples(min_samples),
        )
    }

    #[test]
    fn test_breaker_starts_closed() {
        let breaker = breaker(4);
        assert!(!breaker.is_tripped());
        assert!(!breaker.take_alert());
        assert_eq!(breaker.state(), CircuitBreakerState::default());
    }

    #[test]
    fn test_needs_min_samples() {
        let breaker = breaker(4);
        assert!(!breaker.record_failure("timeout"));
        assert!(!breaker.record_failure("timeout"));
        assert!(!breaker.record_failure("timeout"));
        assert!(!breaker.is_tripped());
        assert!(breaker.record_failure("timeout"));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_fraction_must_be_exceeded() {
        let breaker = breaker(4);
        breaker.record_success();
        breaker.record_success();
        breaker.record_failure("a");
        assert!(!breaker.record_failure("b"));
        // 2/4 is not > 0.5
        assert!(!breaker.is_tripped());
        assert!(breaker.record_failure("c"));
    }

    #[test]
    fn test_alert_latch_fires_once_per_trip() {
        let breaker = breaker(1);
        breaker.record_failure("boom");
        assert!(breaker.take_alert());
        assert!(!breaker.take_alert());

        breaker.clear();
        assert!(!breaker.is_tripped());
        breaker.record_failure("boom again");
        assert!(breaker.take_alert());
    }

    #[test]
    fn test_stays_tripped_until_clear() {
        let breaker = breaker(1);
        breaker.record_failure("boom");
        for _ in 0..10 {
            breaker.record_success();
        }
        assert!(breaker.is_tripped());
        let state = breaker.state();
        assert!(state.reason.unwrap().contains("boom"));
        assert!(state.tripped_at.is_some());

        breaker.clear();
        assert_eq!(breaker.stats().samples, 0);
    }

    #[test]
    fn test_pruned_failures_do_not_trip() {
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .window(Duration::from_secs(60))
                .min_samples(2),
        );
        let old = Utc::now() - ChronoDuration::seconds(120);
        breaker.record_at(old, false, None);
        assert!(!breaker.record_at(Utc::now(), true, None));
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.stats().samples, 1);
    }

    #[test]
    fn test_restore_tripped_state() {
        let breaker = breaker(4);
        breaker.restore(CircuitBreakerState {
            tripped: true,
            reason: Some("persisted".into()),
            tripped_at: Some(Utc::now()),
        });
        assert!(breaker.is_tripped());
        assert!(breaker.take_alert());
        assert_eq!(breaker.state().reason.as_deref(), Some("persisted"));
    }
}
