use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket guarding calls to one external-API quota group.
///
/// Refill is lazy: tokens are topped up from the elapsed time whenever the
/// bucket is touched. Tokens stay within `0..=capacity`.
#[derive(Debug, Clone)]
pub struct QuotaBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

/// Point-in-time view of a bucket, for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub capacity: u32,
    pub tokens: f64,
    pub refill_rate: f64,
}

impl QuotaBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.consume(1)
    }

    pub fn consume(&mut self, tokens: u32) -> bool {
        self.refill();

        if self.tokens >= tokens as f64 {
            self.tokens -= tokens as f64;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&mut self) -> u32 {
        self.refill();
        self.tokens.floor() as u32
    }

    pub fn tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn snapshot(&mut self) -> BucketSnapshot {
        BucketSnapshot {
            capacity: self.capacity,
            tokens: self.tokens(),
            refill_rate: self.refill_rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);

        if elapsed.is_zero() {
            return;
        }

        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
        self.last_refill = now;
    }

    /// Time until `required_tokens` will be available, or `None` if they are
    /// available now. A bucket that never refills reports `Duration::MAX`.
    pub fn time_until_available(&mut self, required_tokens: u32) -> Option<Duration> {
        self.refill();

        if self.tokens >= required_tokens as f64 {
            return None;
        }

        if self.refill_rate <= 0.0 {
            return Some(Duration::MAX);
        }

        let tokens_needed = required_tokens as f64 - self.tokens;
        let seconds_to_wait = tokens_needed / self.refill_rate;

        Some(Duration::from_secs_f64(seconds_to_wait))
    }
}
