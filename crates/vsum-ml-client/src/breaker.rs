//! Consecutive-failure circuit breaker.
//!
//! Closed: calls pass; `threshold` consecutive failures open the circuit.
//! Open: calls fail fast until `open_for` has elapsed.
//! Half-open: one trial call is let through. Success closes the circuit,
//! failure opens it again. A trial whose permit is dropped unresolved (the
//! caller was cancelled) counts as a failure, so the circuit never waits on
//! a call that will not report back.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{MlError, MlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    trial_in_flight: bool,
}

/// Permission to make one call. Resolve it with [`Permit::succeed`] or
/// [`Permit::fail`].
#[must_use = "an unresolved trial permit reopens the circuit when dropped"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl Permit<'_> {
    /// This is the half-open trial call; the caller should not retry inside it.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.on_success();
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.on_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.resolved || !self.trial {
            return;
        }
        warn!(breaker = self.breaker.name, "Trial call abandoned; reopening circuit");
        self.breaker.on_failure();
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    threshold: u32,
    open_for: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32, open_for: Duration) -> Self {
        Self {
            name,
            threshold: threshold.max(1),
            open_for,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to make a call. Fails fast with [`MlError::CircuitOpen`] while open.
    pub fn acquire(&self) -> MlResult<Permit<'_>> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(self.permit(false)),
            CircuitState::Open => {
                let until = inner.open_until.unwrap_or(now);
                if now < until {
                    return Err(MlError::CircuitOpen {
                        retry_in: until - now,
                    });
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = self.name, "Circuit half-open; allowing trial call");
                Ok(self.permit(true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(MlError::CircuitOpen {
                        retry_in: Duration::ZERO,
                    });
                }
                inner.trial_in_flight = true;
                Ok(self.permit(true))
            }
        }
    }

    fn permit(&self, trial: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            trial,
            resolved: false,
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = self.name, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.open_until = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.trial_in_flight = false;

        if inner.state == CircuitState::HalfOpen || inner.consecutive_failures >= self.threshold {
            inner.state = CircuitState::Open;
            inner.open_until = Some(Instant::now() + self.open_for);
            warn!(
                breaker = self.name,
                failures = inner.consecutive_failures,
                open_for_ms = self.open_for.as_millis() as u64,
                "Circuit opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_secs(30));

        breaker.acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(matches!(breaker.acquire(), Err(MlError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_secs(30)).await;
        let permit = breaker.acquire().unwrap();
        assert!(permit.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one trial at a time.
        assert!(breaker.acquire().is_err());

        permit.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(10));
        breaker.on_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        breaker.acquire().unwrap().fail();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_reopens_instead_of_wedging() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(10));
        breaker.on_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.acquire().unwrap();
        assert!(trial.is_trial());
        drop(trial);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.acquire(),
            Err(MlError::CircuitOpen { retry_in }) if retry_in > Duration::ZERO
        ));

        tokio::time::advance(Duration::from_secs(10)).await;
        let next = breaker.acquire().unwrap();
        assert!(next.is_trial());
        next.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn dropping_a_closed_permit_changes_nothing() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(10));
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.acquire().unwrap().is_trial());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(10));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
