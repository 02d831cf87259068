use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::metrics::CIRCUIT_BREAKER_STATE;
use crate::time::{SystemTime, TimeSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric value exported on the state gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures while closed before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive successes while half-open before the breaker closes.
    pub success_threshold: u32,
    /// Time after the last failure before an open breaker lets a probe through.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

/// Gates every outbound submission of the process.
///
/// State is guarded by a mutex: concurrent batch tasks record outcomes from several worker
/// threads, and every transition has to be observed exactly once.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: Arc<dyn TimeSource>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_time_source(config, Arc::new(SystemTime::default()))
    }

    pub fn with_time_source(config: CircuitBreakerConfig, clock: Arc<dyn TimeSource>) -> Self {
        metrics::gauge!(CIRCUIT_BREAKER_STATE).set(CircuitState::Closed.gauge_value());
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // A panic while holding the lock cannot leave the counters half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// False only while open and the timeout since the last failure has not elapsed.
    /// Once it has, the breaker moves to half-open and lets the call through.
    pub fn can_proceed(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return true;
        }

        let elapsed = match inner.last_failure {
            Some(at) => self.clock.now().saturating_duration_since(at),
            None => self.config.timeout,
        };
        if elapsed < self.config.timeout {
            return false;
        }

        inner.failures = 0;
        inner.successes = 0;
        self.transition(&mut inner, CircuitState::HalfOpen);
        true
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.failures = 0;
                    inner.successes = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes = 0;
                inner.last_failure = Some(self.clock.now());
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.last_failure = Some(self.clock.now());
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => inner.last_failure = Some(self.clock.now()),
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        metrics::gauge!(CIRCUIT_BREAKER_STATE).set(to.gauge_value());

        match to {
            CircuitState::Open => warn!(
                from = %from,
                failures = inner.failures,
                "circuit breaker opened"
            ),
            _ => info!(from = %from, to = %to, "circuit breaker state changed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl TimeSource for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }
    }

    fn breaker(failures: u32, successes: u32) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::with_time_source(
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                timeout: Duration::from_secs(60),
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn test_opens_after_threshold_and_recovers() {
        let (breaker, clock) = breaker(2, 1);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_proceed());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(60));
        assert!(breaker.can_proceed());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let (breaker, _) = breaker(2, 1);

        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failure_while_half_open_reopens() {
        let (breaker, clock) = breaker(1, 3);

        breaker.record_failure();
        clock.advance(Duration::from_secs(61));
        assert!(breaker.can_proceed());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_proceed());
    }

    #[test]
    fn test_half_open_needs_consecutive_successes() {
        let (breaker, clock) = breaker(1, 2);

        breaker.record_failure();
        clock.advance(Duration::from_secs(60));
        assert!(breaker.can_proceed());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_while_open_extend_timeout() {
        let (breaker, clock) = breaker(1, 1);

        breaker.record_failure();
        clock.advance(Duration::from_secs(30));
        breaker.record_failure();
        clock.advance(Duration::from_secs(30));

        assert!(!breaker.can_proceed());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(breaker.can_proceed());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(CircuitState::Closed.gauge_value(), 0.0);
        assert_eq!(CircuitState::HalfOpen.gauge_value(), 1.0);
        assert_eq!(CircuitState::Open.gauge_value(), 2.0);
        assert_eq!(CircuitState::HalfOpen.to_string(), "half-open");
    }
}
