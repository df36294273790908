// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Strategies
//!
//! Pure backoff and retry-eligibility policies. A strategy decides whether a
//! failed attempt may be retried and how long to wait before the next one;
//! the caller owns the actual sleep, which keeps the inter-attempt wait an
//! explicit suspension point.

use crate::errors::MessagingError;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Retry-eligibility and backoff policy.
///
/// What changes between strategies: attempt ceiling and backoff curve.
/// What never changes: permanent errors are never retried.
pub trait RetryStrategy: Send + Sync {
    /// Whether `attempt` (1-indexed: the number of attempts already made)
    /// should be followed by another try.
    fn should_retry(&self, attempt: u32, error: &MessagingError) -> bool;

    /// How long to wait before the given attempt.
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with symmetric ±20% jitter.
///
/// `delay = min(max_delay, base_delay * factor^attempt)`, jittered to avoid
/// synchronized retry storms across many callers.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, error: &MessagingError) -> bool {
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return false;
        }
        if error.is_permanent() {
            debug!(kind = error.kind(), "permanent error, not retrying");
            return false;
        }
        true
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());

        let jitter = capped * 0.2 * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Linear backoff: `delay = min(max_delay, base_delay + increment * attempt)`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub increment: Duration,
    pub max_delay: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        LinearBackoff {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            increment: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryStrategy for LinearBackoff {
    fn should_retry(&self, attempt: u32, error: &MessagingError) -> bool {
        attempt < self.max_attempts && !error.is_permanent()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay + self.increment * attempt;
        delay.min(self.max_delay)
    }
}

/// Fail-fast mode for latency-critical callers: never retries, zero delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn should_retry(&self, _attempt: u32, _error: &MessagingError) -> bool {
        false
    }

    fn backoff(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}
