//! Rate limiting for callback tool calls
//!
//! An agent stuck in a loop can fire tool calls as fast as the model answers.
//! Each call may run host callables, so the callback server puts a token
//! bucket in front of the tool dispatch:
//!
//! ```text
//! ┌─────────────┐
//! │   Bucket    │ ← holds up to `capacity` tokens
//! │  ● ● ● ●    │ ← refills at `refill_rate` tokens per second
//! └─────────────┘
//!       │  tools/call
//!       ▼
//!   token? ── yes ──► run the tool
//!       │
//!       └──── no ───► error payload, agent backs off and retries
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tokens are stored scaled so fractional refills are not lost
const SCALE: u64 = 1000;

pub struct RateLimiter {
    capacity: u64,
    refill_rate: f64,
    tokens_scaled: AtomicU64,
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    /// `capacity` is the burst size, `refill_rate` the sustained calls per second
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens_scaled: AtomicU64::new(capacity * SCALE),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// 30 call burst, 5 calls per second sustained
    pub fn with_defaults() -> Self {
        Self::new(30, 5.0)
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.refill();
        let mut current = self.tokens_scaled.load(Ordering::Relaxed);
        loop {
            if current < SCALE {
                return false;
            }
            match self.tokens_scaled.compare_exchange_weak(
                current,
                current - SCALE,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), with a retry hint on refusal
    pub fn check(&self) -> Result<(), RateLimitError> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(RateLimitError::new(self.refill_rate))
        }
    }

    fn refill(&self) {
        let now = Instant::now();
        let mut last = self
            .last_refill
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = now.duration_since(*last);
        let tokens_to_add = (elapsed.as_secs_f64() * self.refill_rate * SCALE as f64) as u64;
        if tokens_to_add == 0 {
            return;
        }
        *last = now;

        let max_scaled = self.capacity * SCALE;
        let _ = self
            .tokens_scaled
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |current| {
                Some(current.saturating_add(tokens_to_add).min(max_scaled))
            });
    }

    pub fn available_tokens(&self) -> u64 {
        self.tokens_scaled.load(Ordering::Relaxed) / SCALE
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// A refused call and how long until a token is available
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitError {
    pub retry_after: Duration,
}

impl RateLimitError {
    pub fn new(refill_rate: f64) -> Self {
        let retry_secs = if refill_rate > 0.0 { 1.0 / refill_rate } else { 1.0 };
        Self {
            retry_after: Duration::from_secs_f64(retry_secs),
        }
    }
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "too many tool calls, retry after {} ms",
            self.retry_after.as_millis()
        )
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refuse() {
        let limiter = RateLimiter::new(3, 1.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_refill() {
        let limiter = RateLimiter::new(2, 100.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_check_reports_retry_hint() {
        let limiter = RateLimiter::new(1, 4.0);
        assert!(limiter.check().is_ok());
        let err = limiter.check().unwrap_err();
        assert_eq!(err.retry_after, Duration::from_millis(250));
        assert!(err.to_string().contains("250 ms"));
    }

    #[test]
    fn test_defaults_and_tokens() {
        let limiter = RateLimiter::with_defaults();
        assert_eq!(limiter.capacity(), 30);
        assert!((limiter.refill_rate() - 5.0).abs() < 0.01);
        assert_eq!(limiter.available_tokens(), 30);
        limiter.try_acquire();
        assert_eq!(limiter.available_tokens(), 29);
    }
}
