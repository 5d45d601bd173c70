//! Consecutive-failure circuit breaker.
//!
//! Closed: calls go through, consecutive failures are counted.
//! Open: calls are rejected without running until `reset_timeout` elapses.
//! HalfOpen: one trial call is let through; success closes the circuit,
//! failure opens it again.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started_at: None,
            }),
        }
    }

    /// Runs `f` unless the circuit is open. `f` resolving to `Err` counts as
    /// a failure.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(CircuitBreakerError::Open);
        }

        match f.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another caller panicked mid-update;
        // the counters are still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => true,
            State::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if cooled_down {
                    log::info!("Circuit breaker half-open, allowing a trial request");
                    inner.state = State::HalfOpen;
                    inner.trial_started_at = Some(Instant::now());
                }
                cooled_down
            }
            State::HalfOpen => {
                // A trial that never reported back (its future was dropped)
                // must not wedge the breaker.
                let stale = inner
                    .trial_started_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if stale {
                    inner.trial_started_at = Some(Instant::now());
                }
                stale
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != State::Closed {
            log::info!("Circuit breaker closed, upstream recovered");
        }
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_started_at = None;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let should_open = inner.state == State::HalfOpen || inner.consecutive_failures >= self.config.failure_threshold;
        if should_open {
            if inner.state != State::Open {
                log::warn!(
                    "Circuit breaker opened after {} consecutive failures",
                    inner.consecutive_failures
                );
            }
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_started_at = None;
        }
    }
}
