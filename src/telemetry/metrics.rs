//! Metrics collection for pool monitoring.

use crate::executor::TaskError;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-pool metrics collector
#[derive(Debug)]
pub struct Metrics {
    tasks_submitted: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_panicked: AtomicU64,
    tasks_crashed: AtomicU64,
    tasks_aborted: AtomicU64,
    unit_restarts: AtomicU64,

    // run time of completed tasks, in nanoseconds
    latency_histogram: Mutex<Histogram<u64>>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        // 3 significant figures, max value of 1 hour in nanoseconds
        let histogram = Histogram::new_with_max(3_600_000_000_000, 3)
            .expect("histogram bounds are constant and valid");

        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_panicked: AtomicU64::new(0),
            tasks_crashed: AtomicU64::new(0),
            tasks_aborted: AtomicU64::new(0),
            unit_restarts: AtomicU64::new(0),
            latency_histogram: Mutex::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_submit(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task that ran to completion on a unit.
    pub fn record_completion<R, E>(&self, outcome: &Result<R, TaskError<E>>, run_time: Duration) {
        let counter = match outcome {
            Ok(_) => &self.tasks_succeeded,
            Err(TaskError::Panicked(_)) => &self.tasks_panicked,
            Err(_) => &self.tasks_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let nanos = u64::try_from(run_time.as_nanos()).unwrap_or(u64::MAX);
        // values beyond the max are clamped rather than dropped
        self.latency_histogram.lock().saturating_record(nanos);
    }

    pub fn record_crash(&self) {
        self.tasks_crashed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self, count: usize) {
        self.tasks_aborted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.unit_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.lock();

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            tasks_crashed: self.tasks_crashed.load(Ordering::Relaxed),
            tasks_aborted: self.tasks_aborted.load(Ordering::Relaxed),
            unit_restarts: self.unit_restarts.load(Ordering::Relaxed),
            avg_latency_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_latency_ns: histogram.value_at_quantile(0.50),
            p95_latency_ns: histogram.value_at_quantile(0.95),
            p99_latency_ns: histogram.value_at_quantile(0.99),
            max_latency_ns: histogram.max(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    #[serde(serialize_with = "as_millis")]
    pub uptime: Duration,
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_panicked: u64,
    pub tasks_crashed: u64,
    pub tasks_aborted: u64,
    pub unit_restarts: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p95_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Tasks that have produced their result, whatever the outcome.
    pub fn tasks_resolved(&self) -> u64 {
        self.tasks_succeeded
            + self.tasks_failed
            + self.tasks_panicked
            + self.tasks_crashed
            + self.tasks_aborted
    }

    /// Submitted tasks still waiting for a result.
    pub fn tasks_outstanding(&self) -> u64 {
        self.tasks_submitted.saturating_sub(self.tasks_resolved())
    }

    pub fn tasks_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.tasks_resolved() as f64 / seconds
    }
}

fn as_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_submit();
        metrics.record_submit();
        metrics.record_submit();
        metrics.record_completion::<u32, String>(&Ok(1), Duration::from_micros(10));
        metrics.record_completion::<u32, String>(
            &Err(TaskError::Failed("nope".into())),
            Duration::from_micros(20),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 3);
        assert_eq!(snapshot.tasks_succeeded, 1);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_resolved(), 2);
        assert_eq!(snapshot.tasks_outstanding(), 1);
        assert!(snapshot.avg_latency_ns > 0);
    }

    #[test]
    fn test_panics_counted_separately() {
        let metrics = Metrics::new();
        metrics.record_completion::<u32, String>(
            &Err(TaskError::Panicked("oops".into())),
            Duration::from_millis(1),
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_panicked, 1);
        assert_eq!(snapshot.tasks_failed, 0);
    }

    #[test]
    fn test_pool_level_counters() {
        let metrics = Metrics::new();
        metrics.record_crash();
        metrics.record_restart();
        metrics.record_restart();
        metrics.record_aborted(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_crashed, 1);
        assert_eq!(snapshot.unit_restarts, 2);
        assert_eq!(snapshot.tasks_aborted, 4);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = Metrics::new().snapshot();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["tasks_submitted"], 0);
        assert!(value["uptime"].is_u64());
    }
}
