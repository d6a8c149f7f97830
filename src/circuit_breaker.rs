//! Circuit breaker around external calls (C4, §4.4).
//!
//! State machine shape (`Closed`/`Open`/`HalfOpen`, atomic state for cheap
//! reads) is grounded on
//! `tower-resilience-circuitbreaker::circuit::Circuit`, simplified from a
//! generic tower middleware into a concrete guard used directly by the
//! crawler's Reddit client.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{0}' is open")]
pub struct CircuitOpenError(pub String);

struct Inner {
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// One named circuit breaker instance (one per external dependency class,
/// e.g. `"reddit-api"`).
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    half_open_max_in_flight: u32,
    state: AtomicU8,
    trip_count: AtomicU32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, success_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            cooldown,
            half_open_max_in_flight: 1,
            state: AtomicU8::new(CircuitState::Closed as u8),
            trip_count: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn trip_count(&self) -> u32 {
        self.trip_count.load(Ordering::Relaxed)
    }

    /// Call before issuing the guarded operation. Transitions Open →
    /// HalfOpen once the cooldown has elapsed and admits a bounded number
    /// of in-flight probes while HalfOpen.
    pub fn try_acquire(&self) -> Result<CircuitGuard<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock().unwrap();
        match self.state() {
            CircuitState::Closed => Ok(CircuitGuard { breaker: self }),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
                    inner.consecutive_successes = 0;
                    inner.half_open_in_flight = 1;
                    Ok(CircuitGuard { breaker: self })
                } else {
                    Err(CircuitOpenError(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max_in_flight {
                    inner.half_open_in_flight += 1;
                    Ok(CircuitGuard { breaker: self })
                } else {
                    Err(CircuitOpenError(self.name.clone()))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match self.state() {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    self.state.store(CircuitState::Closed as u8, Ordering::Release);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    tracing::info!(circuit = %self.name, "circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match self.state() {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        inner.opened_at = Some(Instant::now());
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        self.trip_count.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(circuit = %self.name, "circuit opened");
    }

    /// Gauge value for `/metrics`: 0=closed, 1=open, 2=half-open.
    pub fn gauge_value(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// RAII-ish token returned by `try_acquire`; callers must report the
/// outcome exactly once via `success()`/`failure()`.
pub struct CircuitGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl CircuitGuard<'_> {
    pub fn success(self) {
        self.breaker.record_success();
    }

    pub fn failure(self) {
        self.breaker.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", 3, 2, Duration::from_millis(50));
        for _ in 0..3 {
            cb.try_acquire().unwrap().failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test]
    async fn half_open_closes_after_successes() {
        let cb = CircuitBreaker::new("test", 1, 2, Duration::from_millis(10));
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cb.try_acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.try_acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", 1, 2, Duration::from_millis(10));
        cb.try_acquire().unwrap().failure();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
