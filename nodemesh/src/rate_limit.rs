//! Per-principal token bucket rate limiting for inbound requests

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Result of a rate limit check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed,
    RateLimited {
        /// Time until the next request will be allowed
        retry_after: Duration,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by principal (node id, key name or client address)
pub struct RateLimiter {
    enabled: bool,
    /// Tokens added per second
    rate: f64,
    burst: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let rpm = config.requests_per_minute.max(1);
        Self {
            enabled: config.enabled,
            rate: rpm as f64 / 60.0,
            burst: config.burst.unwrap_or(rpm).max(1) as f64,
            buckets: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Take one token from the principal's bucket
    pub fn check(&self, principal: &str) -> RateLimitResult {
        if !self.enabled {
            return RateLimitResult::Allowed;
        }

        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(principal.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.burst,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitResult::Allowed
        } else {
            let missing = 1.0 - bucket.tokens;
            RateLimitResult::RateLimited {
                retry_after: Duration::from_secs_f64(missing / self.rate),
            }
        }
    }

    /// Drop buckets that have been idle long enough to be full again
    pub fn cleanup(&self) -> usize {
        let full_after = Duration::from_secs_f64(self.burst / self.rate);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| b.last_refill.elapsed() < full_after);
        before - self.buckets.len()
    }
}
