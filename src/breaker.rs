// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Circuit Breaker
//!
//! Failure-count state machine protecting downstream broker calls:
//! CLOSED → OPEN after `failure_threshold` consecutive failures, OPEN →
//! HALF_OPEN once `timeout` elapses, HALF_OPEN → CLOSED after
//! `success_threshold` consecutive successes, HALF_OPEN → OPEN on any
//! failure. While OPEN, calls are rejected without invoking the wrapped
//! operation.

use crate::errors::MessagingError;
use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker with a configurable half-open exit policy.
///
/// `success_threshold` generalizes the two exit policies: 1 closes on the
/// first successful trial call, K requires K consecutive successes.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    success_threshold: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker with `success_threshold = 1`: a single half-open
    /// success closes the circuit.
    pub fn new(failure_threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::with_success_threshold(failure_threshold, timeout, 1)
    }

    pub fn with_success_threshold(
        failure_threshold: u32,
        timeout: Duration,
        success_threshold: u32,
    ) -> CircuitBreaker {
        CircuitBreaker {
            name: "publisher".to_owned(),
            failure_threshold: failure_threshold.max(1),
            timeout,
            success_threshold: success_threshold.max(1),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Runs `operation` under the breaker.
    ///
    /// If the circuit is OPEN and the timeout has not elapsed, the operation
    /// is never invoked and `CircuitOpen` is returned immediately. The lock
    /// is never held across the await.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, MessagingError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MessagingError>>,
    {
        self.before_call()?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        Self::check_timeout(&self.name, self.timeout, &mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Manually closes the circuit. Use after the broker is known to have
    /// recovered.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(circuit = %self.name, "circuit manually reset to closed");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
    }

    fn before_call(&self) -> Result<(), MessagingError> {
        let mut inner = self.inner.lock();
        Self::check_timeout(&self.name, self.timeout, &mut inner);

        if inner.state == CircuitState::Open {
            debug!(circuit = %self.name, "circuit is open, rejecting call");
            return Err(MessagingError::CircuitOpen);
        }
        Ok(())
    }

    fn check_timeout(name: &str, timeout: Duration, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= timeout {
                    info!(circuit = %name, "open timeout elapsed, transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                // Reset, not decrement: stale failures must not accumulate.
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                debug!(
                    circuit = %self.name,
                    successes = inner.success_count,
                    threshold = self.success_threshold,
                    "success while half-open"
                );
                if inner.success_count >= self.success_threshold {
                    info!(circuit = %self.name, "success threshold reached, closing circuit");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "failure while half-open, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                warn!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    "failure threshold reached, opening circuit"
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            _ => {
                debug!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    "failure recorded"
                );
            }
        }
    }
}
