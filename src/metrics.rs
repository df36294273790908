// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Metrics
//!
//! Thread-safe counters, gauges and timers keyed by free-form dotted names.
//! Timers keep a bounded rolling window (oldest samples evicted) and expose
//! count/min/max/average plus linearly-interpolated percentiles. Error
//! counters are keyed by (queue, error-kind).
//!
//! There is no module-level global: construct one instance per process and
//! share the handle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Rolling window size per timer, to prevent unbounded growth.
const TIMER_WINDOW: usize = 1000;

#[derive(Default)]
struct MetricsInner {
    counters: HashMap<String, i64>,
    gauges: HashMap<String, f64>,
    timers: HashMap<String, VecDeque<f64>>,
    errors: HashMap<String, HashMap<String, u64>>,
}

/// Statistics over one timer's rolling window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time snapshot of every metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub counters: BTreeMap<String, i64>,
    pub gauges: BTreeMap<String, f64>,
    pub timers: BTreeMap<String, TimerStats>,
    pub errors: BTreeMap<String, BTreeMap<String, u64>>,
    pub timestamp: DateTime<Utc>,
}

/// Thread-safe metrics registry for the messaging layer.
#[derive(Default)]
pub struct MessagingMetrics {
    inner: Mutex<MetricsInner>,
}

impl MessagingMetrics {
    /// Creates a shareable handle; pass clones through constructors instead
    /// of relying on process-wide state.
    pub fn new() -> Arc<MessagingMetrics> {
        Arc::new(MessagingMetrics::default())
    }

    pub fn increment(&self, name: &str, value: i64) {
        let mut inner = self.inner.lock();
        *inner.counters.entry(name.to_owned()).or_insert(0) += value;
    }

    pub fn decrement(&self, name: &str, value: i64) {
        self.increment(name, -value);
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock();
        inner.gauges.insert(name.to_owned(), value);
    }

    /// Records a duration sample in milliseconds, evicting the oldest sample
    /// once the window is full.
    pub fn record_time(&self, name: &str, duration_ms: f64) {
        let mut inner = self.inner.lock();
        let window = inner.timers.entry(name.to_owned()).or_default();
        window.push_back(duration_ms);
        while window.len() > TIMER_WINDOW {
            window.pop_front();
        }
    }

    /// Records an error keyed by (queue, error-kind) and bumps the queue's
    /// total error counter.
    pub fn record_error(&self, queue: &str, error_kind: &str) {
        let mut inner = self.inner.lock();
        *inner
            .errors
            .entry(format!("errors.{queue}"))
            .or_default()
            .entry(error_kind.to_owned())
            .or_insert(0) += 1;
        *inner
            .counters
            .entry(format!("total_errors.{queue}"))
            .or_insert(0) += 1;
        *inner.counters.entry("total_errors".to_owned()).or_insert(0) += 1;
    }

    pub fn record_published(&self, routing_key: &str) {
        self.increment(&format!("messages.published.{routing_key}"), 1);
        self.increment("total_messages.published", 1);
    }

    pub fn record_consumed(&self, queue: &str) {
        self.increment(&format!("messages.consumed.{queue}"), 1);
    }

    pub fn record_acked(&self, queue: &str) {
        self.increment(&format!("messages.acked.{queue}"), 1);
    }

    pub fn record_nacked(&self, queue: &str, requeued: bool) {
        if requeued {
            self.increment(&format!("messages.nacked.{queue}.requeued"), 1);
        } else {
            self.increment(&format!("messages.nacked.{queue}.dlq"), 1);
        }
    }

    pub fn record_dlq(&self, queue: &str, reason: &str) {
        self.increment(&format!("dlq.messages.{queue}"), 1);
        self.increment(&format!("dlq.{queue}.{reason}"), 1);
    }

    pub fn counter(&self, name: &str) -> i64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.inner.lock().gauges.get(name).copied()
    }

    /// Sum of all counters whose name starts with `prefix`.
    pub fn counter_sum(&self, prefix: &str) -> i64 {
        self.inner
            .lock()
            .counters
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, value)| value)
            .sum()
    }

    pub fn timer_stats(&self, name: &str) -> Option<TimerStats> {
        let inner = self.inner.lock();
        inner.timers.get(name).and_then(|w| compute_stats(w))
    }

    /// Error counts by kind for one queue, or for every queue.
    pub fn error_summary(&self, queue: Option<&str>) -> BTreeMap<String, BTreeMap<String, u64>> {
        let inner = self.inner.lock();
        inner
            .errors
            .iter()
            .filter(|(name, _)| match queue {
                Some(q) => name.as_str() == format!("errors.{q}"),
                None => true,
            })
            .map(|(name, kinds)| {
                let queue_name = name.trim_start_matches("errors.").to_owned();
                (queue_name, kinds.iter().map(|(k, v)| (k.clone(), *v)).collect())
            })
            .collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock();
        MetricsSummary {
            counters: inner.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            gauges: inner.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            timers: inner
                .timers
                .iter()
                .filter_map(|(name, window)| compute_stats(window).map(|s| (name.clone(), s)))
                .collect(),
            errors: inner
                .errors
                .iter()
                .map(|(name, kinds)| {
                    (
                        name.trim_start_matches("errors.").to_owned(),
                        kinds.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                    )
                })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    /// Clears one metric by name, or everything when `name` is `None`.
    pub fn reset(&self, name: Option<&str>) {
        let mut inner = self.inner.lock();
        match name {
            Some(name) => {
                if let Some(counter) = inner.counters.get_mut(name) {
                    *counter = 0;
                }
                if let Some(window) = inner.timers.get_mut(name) {
                    window.clear();
                }
                inner.gauges.remove(name);
            }
            None => {
                inner.counters.clear();
                inner.gauges.clear();
                inner.timers.clear();
                inner.errors.clear();
            }
        }
    }
}

fn compute_stats(window: &VecDeque<f64>) -> Option<TimerStats> {
    if window.is_empty() {
        return None;
    }

    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();

    Some(TimerStats {
        count,
        min: sorted[0],
        max: sorted[count - 1],
        avg: sum / count as f64,
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    })
}

/// Linearly-interpolated percentile over sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * (p / 100.0);
    let floor = k.floor() as usize;
    let ceil = (floor + 1).min(sorted.len() - 1);

    if floor == ceil {
        return sorted[floor];
    }
    sorted[floor] + (k - floor as f64) * (sorted[ceil] - sorted[floor])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_decrement() {
        let metrics = MessagingMetrics::new();
        metrics.increment("messages.published.content.discovered", 1);
        metrics.increment("messages.published.content.discovered", 2);
        metrics.decrement("messages.published.content.discovered", 1);
        assert_eq!(metrics.counter("messages.published.content.discovered"), 2);
        assert_eq!(metrics.counter("unknown"), 0);
    }

    #[test]
    fn nack_recorders_split_requeue_and_dlq() {
        let metrics = MessagingMetrics::new();
        metrics.record_nacked("content.discovered", true);
        metrics.record_nacked("content.discovered", true);
        metrics.record_nacked("content.discovered", false);

        assert_eq!(
            metrics.counter("messages.nacked.content.discovered.requeued"),
            2
        );
        assert_eq!(metrics.counter("messages.nacked.content.discovered.dlq"), 1);
    }

    #[test]
    fn dlq_recorder_tracks_reason() {
        let metrics = MessagingMetrics::new();
        metrics.record_dlq("digest.ready", "validation_error");
        metrics.record_dlq("digest.ready", "validation_error");
        metrics.record_dlq("digest.ready", "permanent_error");

        assert_eq!(metrics.counter("dlq.messages.digest.ready"), 3);
        assert_eq!(metrics.counter("dlq.digest.ready.validation_error"), 2);
        assert_eq!(metrics.counter("dlq.digest.ready.permanent_error"), 1);
    }

    #[test]
    fn timer_stats_with_interpolated_percentiles() {
        let metrics = MessagingMetrics::new();
        for v in 1..=100 {
            metrics.record_time("consumed.content.discovered", v as f64);
        }

        let stats = metrics.timer_stats("consumed.content.discovered").unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.avg - 50.5).abs() < 1e-9);
        assert!((stats.p50 - 50.5).abs() < 1e-9);
        assert!((stats.p95 - 95.05).abs() < 1e-9);
        assert!((stats.p99 - 99.01).abs() < 1e-9);
    }

    #[test]
    fn timer_window_evicts_oldest_samples() {
        let metrics = MessagingMetrics::new();
        for v in 0..1500 {
            metrics.record_time("handler.extract", v as f64);
        }

        let stats = metrics.timer_stats("handler.extract").unwrap();
        assert_eq!(stats.count, 1000);
        assert_eq!(stats.min, 500.0);
        assert_eq!(stats.max, 1499.0);
    }

    #[test]
    fn error_summary_by_queue() {
        let metrics = MessagingMetrics::new();
        metrics.record_error("content.discovered", "validation_error");
        metrics.record_error("content.discovered", "validation_error");
        metrics.record_error("digest.ready", "publish_error");

        let all = metrics.error_summary(None);
        assert_eq!(all["content.discovered"]["validation_error"], 2);
        assert_eq!(all["digest.ready"]["publish_error"], 1);

        let one = metrics.error_summary(Some("digest.ready"));
        assert_eq!(one.len(), 1);
        assert_eq!(metrics.counter("total_errors"), 3);
        assert_eq!(metrics.counter("total_errors.content.discovered"), 2);
    }

    #[test]
    fn counter_sum_over_prefix() {
        let metrics = MessagingMetrics::new();
        metrics.record_published("content.discovered");
        metrics.record_published("digest.ready");
        assert_eq!(metrics.counter_sum("messages.published."), 2);
        assert_eq!(metrics.counter("total_messages.published"), 2);
    }

    #[test]
    fn reset_single_and_all() {
        let metrics = MessagingMetrics::new();
        metrics.increment("a", 5);
        metrics.increment("b", 7);
        metrics.set_gauge("g", 1.0);
        metrics.record_time("t", 10.0);

        metrics.reset(Some("a"));
        assert_eq!(metrics.counter("a"), 0);
        assert_eq!(metrics.counter("b"), 7);
        assert_eq!(metrics.gauge("g"), Some(1.0));

        metrics.reset(None);
        assert_eq!(metrics.counter("b"), 0);
        assert_eq!(metrics.gauge("g"), None);
        assert!(metrics.timer_stats("t").is_none());
    }

    #[test]
    fn summary_snapshot_serializes() {
        let metrics = MessagingMetrics::new();
        metrics.record_published("content.discovered");
        metrics.record_time("consumed.content.discovered", 12.5);
        metrics.record_error("content.discovered", "transient_error");

        let summary = metrics.summary();
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(
            value["counters"]["messages.published.content.discovered"],
            1
        );
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }
}
