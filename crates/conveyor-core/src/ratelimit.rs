//! Token-bucket rate limiter
//!
//! Offered to executors that call externally-quota'd services. The bucket
//! refills continuously at `refill_rate` tokens per second up to
//! `max_tokens`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket.
///
/// # Example
///
/// ```
/// use conveyor_core::ratelimit::TokenBucket;
///
/// let bucket = TokenBucket::new(10.0, 5.0);
/// assert!(bucket.try_acquire(1.0));
/// ```
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket holding at most `max_tokens`, refilled at
    /// `refill_rate` tokens per second. The bucket starts full.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens: max_tokens.max(0.0),
            refill_rate: refill_rate.max(0.0),
            state: Mutex::new(BucketState {
                tokens: max_tokens.max(0.0),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `amount` tokens if available; returns whether they were taken.
    pub fn try_acquire(&self, amount: f64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= amount {
            state.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Wait until `amount` tokens are available, then take them.
    pub async fn acquire(&self, amount: f64) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= amount {
                    state.tokens -= amount;
                    return;
                }
                let deficit = amount - state.tokens;
                if self.refill_rate <= 0.0 {
                    // Never refills; avoid a busy loop.
                    Duration::from_secs(1)
                } else {
                    Duration::from_secs_f64(deficit / self.refill_rate)
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        state.last_refill = now;
    }
}
