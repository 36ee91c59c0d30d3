//! Token bucket admission gate
//!
//! Called by the front-end before each engine operation; a denied request is
//! never forwarded. The bucket refills to full capacity once more than one
//! interval has passed since the previous refill.

use crate::config::TokenBucketConfig;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

pub struct RateLimiter {
    max_tokens: u64,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &TokenBucketConfig) -> Self {
        Self::with_interval(config.max_tokens, Duration::from_secs(config.interval_secs))
    }

    pub fn with_interval(max_tokens: u64, interval: Duration) -> Self {
        Self::starting_at(max_tokens, interval, Instant::now())
    }

    /// Full bucket whose refill clock starts at `start`.
    pub fn starting_at(max_tokens: u64, interval: Duration, start: Instant) -> Self {
        Self {
            max_tokens,
            interval,
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: start,
            }),
        }
    }

    /// Spend one token if one is available.
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    pub fn allow_request_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        if now.saturating_duration_since(bucket.last_refill) > self.interval {
            bucket.tokens = self.max_tokens;
            bucket.last_refill = now;
        }
        if bucket.tokens == 0 {
            tracing::debug!("Rate limit reached, request denied");
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    pub fn available_tokens(&self) -> u64 {
        self.bucket.lock().tokens
    }
}
