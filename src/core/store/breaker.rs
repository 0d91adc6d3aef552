//! Circuit breaker for store calls
//!
//! Closed: calls flow and consecutive failures are counted. When the count
//! reaches the threshold the breaker opens and calls fail fast until the
//! reset timeout elapses. Then a single probe is let through (half-open);
//! its outcome either closes the breaker or re-opens it for another period.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default consecutive failures before the breaker opens
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time spent open before a probe is allowed
const DEFAULT_RESET_TIMEOUT_SECS: u64 = 30;

/// Default probe successes needed to close again
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_RESET_TIMEOUT_SECS),
        }
    }
}

impl BreakerConfig {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Error returned by [`CircuitBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Current state, moving Open to HalfOpen once the reset timeout elapsed
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now. In half-open only one probe is
    /// admitted at a time.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => inner.failures = 0,
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    tracing::info!("Store circuit breaker closed after successful probe");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    Self::trip(&mut inner);
                    tracing::warn!(
                        failures = inner.failures,
                        threshold = self.config.failure_threshold,
                        "Store circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                Self::trip(&mut inner);
                tracing::warn!("Store circuit breaker re-opened after failed probe");
            }
            BreakerState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    /// Run `operation` under the breaker, counting every error as a failure
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_with(operation, |_| true).await
    }

    /// Run `operation` under the breaker. Errors for which `is_failure`
    /// returns false still reached the backend and count as successes.
    pub async fn call_with<F, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn trip(inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.successes = 0;
        inner.probe_in_flight = false;
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            inner.state = BreakerState::HalfOpen;
            inner.successes = 0;
            inner.probe_in_flight = false;
            tracing::info!("Store circuit breaker half-open, admitting a probe");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerConfig::default()
                .failure_threshold(threshold)
                .reset_timeout(Duration::from_secs(reset_secs)),
        )
    }

    #[tokio::test]
    async fn test_stays_closed_on_success() {
        let cb = breaker(3, 10);

        for _ in 0..5 {
            let result = cb.call(async { Ok::<_, &str>("ok") }).await;
            assert!(result.is_ok());
        }

        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 10);

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("down") }).await;
            assert!(matches!(result, Err(BreakerError::Inner("down"))));
        }

        assert_eq!(cb.state(), BreakerState::Open);
        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_uncounted_errors_keep_breaker_closed() {
        let cb = breaker(2, 10);
        cb.record_failure();

        for _ in 0..5 {
            let result = cb
                .call_with(async { Err::<(), _>("WRONGTYPE") }, |_| false)
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("WRONGTYPE"))));
        }
        assert_eq!(cb.state(), BreakerState::Closed);

        // The reply above reset the streak, so one more outage is not enough
        let _ = cb.call_with(async { Err::<(), _>("refused") }, |_| true).await;
        assert_eq!(cb.state(), BreakerState::Closed);
        let _ = cb.call_with(async { Err::<(), _>("refused") }, |_| true).await;
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 10);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let cb = breaker(1, 5);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        // One probe only
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breaker(1, 5);
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(6)).await;
        let result = cb.call(async { Err::<(), _>("still down") }).await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BreakerState::Closed.to_string(), "closed");
        assert_eq!(BreakerState::HalfOpen.to_string(), "half-open");
    }
}
