//! Process-global token bucket rate limiter (C1, §4.1).
//!
//! Concrete, concurrency-safe token bucket generalized from the
//! sliding-window state machines in the resilience middleware corpus
//! (`tower-resilience-ratelimiter::limiter::FixedWindowState`), adapted to
//! a blocking `acquire` rather than a tower `Layer`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation returns this without consuming a token.
#[derive(Debug, thiserror::Error)]
#[error("rate limiter acquire cancelled")]
pub struct AcquireCancelled;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single global token bucket. `rate` tokens accrue per second up to
/// `burst`; `Acquire` blocks until one token is available.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimiterMetrics {
    pub tokens_available: f64,
    pub rate_per_sec: f64,
    pub burst: f64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate: rate_per_sec.max(0.001),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }

    /// Wait time required before a token would become available, without
    /// mutating state. Returns `Duration::ZERO` if one is available now.
    fn time_until_token_locked(&self, state: &BucketState) -> Duration {
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
        }
    }

    /// Block until a token is available or `cancel` fires. Cancellation
    /// returns `Err` and never consumes a token.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireCancelled> {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                self.refill_locked(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                self.time_until_token_locked(&state)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => continue,
                _ = cancel.cancelled() => return Err(AcquireCancelled),
            }
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut state = self.state.lock().unwrap();
        self.refill_locked(&mut state);
        RateLimiterMetrics {
            tokens_available: state.tokens,
            rate_per_sec: self.rate,
            burst: self.burst,
        }
    }

    /// Non-blocking variant for the HTTP layer (§6.7): consumes a token and
    /// returns `true` if one was available, `false` otherwise — the caller
    /// rejects the request instead of waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        self.refill_locked(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One token bucket per client IP, created lazily on first sight (§6.7
/// per-client-IP limiting). Bounded by evicting the least-recently-created
/// entry once `max_tracked` distinct IPs are held, so an unbounded stream
/// of distinct IPs can't grow this map forever.
pub struct PerKeyRateLimiter {
    rate: f64,
    burst: u32,
    max_tracked: usize,
    buckets: Mutex<HashMap<String, Arc<RateLimiter>>>,
    order: Mutex<Vec<String>>,
}

impl PerKeyRateLimiter {
    pub fn new(rate_per_sec: f64, burst: u32, max_tracked: usize) -> Self {
        Self {
            rate: rate_per_sec,
            burst,
            max_tracked: max_tracked.max(1),
            buckets: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let limiter = {
            let mut buckets = self.buckets.lock().unwrap();
            if let Some(existing) = buckets.get(key) {
                existing.clone()
            } else {
                let mut order = self.order.lock().unwrap();
                if order.len() >= self.max_tracked {
                    if let Some(oldest) = order.first().cloned() {
                        buckets.remove(&oldest);
                        order.remove(0);
                    }
                }
                order.push(key.to_string());
                let created = Arc::new(RateLimiter::new(self.rate, self.burst));
                buckets.insert(key.to_string(), created.clone());
                created
            }
        };
        limiter.try_acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_burst_immediately() {
        let limiter = RateLimiter::new(1.0, 3);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            limiter.acquire(&cancel).await.unwrap();
        }
        assert!(limiter.metrics().tokens_available < 1.0);
    }

    #[test]
    fn try_acquire_rejects_once_burst_exhausted() {
        let limiter = RateLimiter::new(0.001, 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn per_key_limiter_tracks_keys_independently() {
        let limiter = PerKeyRateLimiter::new(0.001, 1, 10);
        assert!(limiter.try_acquire("1.2.3.4"));
        assert!(!limiter.try_acquire("1.2.3.4"));
        assert!(limiter.try_acquire("5.6.7.8"));
    }

    #[tokio::test]
    async fn cancellation_does_not_consume_token() {
        let limiter = RateLimiter::new(0.5, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap(); // drains the single token
        let before = limiter.metrics().tokens_available;

        cancel.cancel();
        let err = limiter.acquire(&cancel).await;
        assert!(err.is_err());
        let after = limiter.metrics().tokens_available;
        assert!((after - before).abs() < 1e-6);
    }
}
