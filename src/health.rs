// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Health
//!
//! Aggregated health for the messaging layer, built for liveness/readiness
//! endpoints. Severity is three-valued: a lost connection is unhealthy and
//! short-circuits the remaining checks; near-full queues, a high error rate
//! or any populated DLQ degrade the status without failing it.

use crate::connection::AmqpConnection;
use crate::messages::QueueName;
use crate::metrics::MessagingMetrics;
use crate::topology::QueueSetup;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Error rate (errors / published) above which the layer is degraded.
const ERROR_RATE_THRESHOLD: f64 = 0.1;

/// Three-valued health severity. Ordering is by severity, worst last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One named check's result.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub state: HealthState,
    pub detail: String,
}

/// Point-in-time health report, serializable for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckResult>,
    pub queue_depths: BTreeMap<String, Option<u32>>,
}

/// Runs the aggregated health check against the live broker and metrics.
pub struct HealthChecker {
    connection: Arc<AmqpConnection>,
    setup: QueueSetup,
    metrics: Arc<MessagingMetrics>,
}

impl HealthChecker {
    pub fn new(connection: Arc<AmqpConnection>, metrics: Arc<MessagingMetrics>) -> HealthChecker {
        let setup = QueueSetup::new(connection.clone());
        HealthChecker {
            connection,
            setup,
            metrics,
        }
    }

    /// Cheap boolean probe for liveness endpoints.
    pub fn quick_check(&self) -> bool {
        self.connection.is_connected()
    }

    /// Full health report: connection, queue depths, DLQ contents and error
    /// rate. Never returns an error; failures surface as unhealthy status.
    pub async fn check(&self) -> HealthStatus {
        let mut checks = BTreeMap::new();

        if !self.connection.is_connected() {
            warn!("health check: broker connection is down");
            checks.insert(
                "connection".to_owned(),
                CheckResult {
                    state: HealthState::Unhealthy,
                    detail: "not connected to the broker".to_owned(),
                },
            );
            // Broker-dependent checks would only add noise.
            return HealthStatus {
                status: HealthState::Unhealthy,
                timestamp: Utc::now(),
                checks,
                queue_depths: BTreeMap::new(),
            };
        }

        checks.insert(
            "connection".to_owned(),
            CheckResult {
                state: HealthState::Healthy,
                detail: "connected".to_owned(),
            },
        );

        let depths: BTreeMap<String, Option<u32>> =
            self.setup.get_queue_depths().await.into_iter().collect();

        checks.insert("queue_depth".to_owned(), self.check_queue_depths(&depths));
        checks.insert("dlq".to_owned(), check_dlqs(&depths));
        checks.insert(
            "error_rate".to_owned(),
            check_error_rate(
                self.metrics.counter("total_errors"),
                self.metrics.counter("total_messages.published"),
            ),
        );

        let status = aggregate(checks.values().map(|check| check.state));
        HealthStatus {
            status,
            timestamp: Utc::now(),
            checks,
            queue_depths: depths,
        }
    }

    fn check_queue_depths(&self, depths: &BTreeMap<String, Option<u32>>) -> CheckResult {
        let warn_fraction = self.connection.config().depth_warning_fraction;
        let mut near_full = vec![];

        for queue in QueueName::ALL {
            let spec = self.setup.queue_spec(queue);
            if let Some(Some(depth)) = depths.get(queue.as_str()) {
                if depth_state(*depth, spec.max_length, warn_fraction) == HealthState::Degraded {
                    warn!(
                        queue = queue.as_str(),
                        depth, max_length = spec.max_length, "queue is near capacity"
                    );
                    near_full.push(format!("{queue} ({depth}/{})", spec.max_length));
                }
            }
        }

        if near_full.is_empty() {
            CheckResult {
                state: HealthState::Healthy,
                detail: "all queues within bounds".to_owned(),
            }
        } else {
            CheckResult {
                state: HealthState::Degraded,
                detail: format!("queues near capacity: {}", near_full.join(", ")),
            }
        }
    }
}

/// Degraded once depth reaches the warning fraction of the bound.
fn depth_state(depth: u32, max_length: u32, warn_fraction: f64) -> HealthState {
    if f64::from(depth) >= f64::from(max_length) * warn_fraction {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Any message sitting in a DLQ (including the catch-all) degrades health.
fn check_dlqs(depths: &BTreeMap<String, Option<u32>>) -> CheckResult {
    let populated: Vec<String> = depths
        .iter()
        .filter(|(name, depth)| name.ends_with(".dlq") && matches!(depth, Some(d) if *d > 0))
        .map(|(name, depth)| format!("{name} ({})", depth.unwrap_or(0)))
        .collect();

    if populated.is_empty() {
        CheckResult {
            state: HealthState::Healthy,
            detail: "all dead-letter queues empty".to_owned(),
        }
    } else {
        CheckResult {
            state: HealthState::Degraded,
            detail: format!("dead-lettered messages in: {}", populated.join(", ")),
        }
    }
}

fn check_error_rate(errors: i64, published: i64) -> CheckResult {
    let rate = error_rate(errors, published);
    if rate > ERROR_RATE_THRESHOLD {
        CheckResult {
            state: HealthState::Degraded,
            detail: format!("error rate {rate:.3} over {published} published"),
        }
    } else {
        CheckResult {
            state: HealthState::Healthy,
            detail: format!("error rate {rate:.3}"),
        }
    }
}

fn error_rate(errors: i64, published: i64) -> f64 {
    if published <= 0 {
        return 0.0;
    }
    errors as f64 / published as f64
}

/// Worst severity wins.
fn aggregate(states: impl Iterator<Item = HealthState>) -> HealthState {
    states.max().unwrap_or(HealthState::Healthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;

    #[test]
    fn depth_reaching_warning_fraction_degrades() {
        assert_eq!(depth_state(7999, 10_000, 0.8), HealthState::Healthy);
        assert_eq!(depth_state(8000, 10_000, 0.8), HealthState::Degraded);
        assert_eq!(depth_state(10_000, 10_000, 0.8), HealthState::Degraded);
        assert_eq!(depth_state(0, 10, 0.8), HealthState::Healthy);
    }

    #[test]
    fn single_dead_lettered_message_degrades() {
        let mut depths = BTreeMap::new();
        depths.insert("content.discovered".to_owned(), Some(5));
        depths.insert("content.discovered.dlq".to_owned(), Some(0));
        assert_eq!(check_dlqs(&depths).state, HealthState::Healthy);

        depths.insert("content.discovered.dlq".to_owned(), Some(1));
        let result = check_dlqs(&depths);
        assert_eq!(result.state, HealthState::Degraded);
        assert!(result.detail.contains("content.discovered.dlq"));
    }

    #[test]
    fn unreadable_dlq_depth_does_not_degrade() {
        let mut depths = BTreeMap::new();
        depths.insert("digest.ready.dlq".to_owned(), None);
        assert_eq!(check_dlqs(&depths).state, HealthState::Healthy);
    }

    #[test]
    fn error_rate_above_threshold_degrades() {
        assert_eq!(check_error_rate(0, 0).state, HealthState::Healthy);
        assert_eq!(check_error_rate(5, 100).state, HealthState::Healthy);
        assert_eq!(check_error_rate(11, 100).state, HealthState::Degraded);
        // No traffic yet means no error rate.
        assert_eq!(check_error_rate(3, 0).state, HealthState::Healthy);
    }

    #[test]
    fn aggregate_takes_worst_severity() {
        assert_eq!(
            aggregate([HealthState::Healthy, HealthState::Healthy].into_iter()),
            HealthState::Healthy
        );
        assert_eq!(
            aggregate([HealthState::Healthy, HealthState::Degraded].into_iter()),
            HealthState::Degraded
        );
        assert_eq!(
            aggregate(
                [
                    HealthState::Degraded,
                    HealthState::Unhealthy,
                    HealthState::Healthy
                ]
                .into_iter()
            ),
            HealthState::Unhealthy
        );
        assert_eq!(aggregate([].into_iter()), HealthState::Healthy);
    }

    #[tokio::test]
    async fn disconnected_broker_is_unhealthy_and_skips_other_checks() {
        let connection = AmqpConnection::new(MessagingConfig::default());
        let checker = HealthChecker::new(connection, MessagingMetrics::new());

        assert!(!checker.quick_check());
        let status = checker.check().await;
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.checks.len(), 1);
        assert_eq!(status.checks["connection"].state, HealthState::Unhealthy);
        assert!(status.queue_depths.is_empty());
    }

    #[test]
    fn status_serializes_with_lowercase_states() {
        let status = HealthStatus {
            status: HealthState::Degraded,
            timestamp: Utc::now(),
            checks: BTreeMap::new(),
            queue_depths: BTreeMap::new(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "degraded");
    }
}
