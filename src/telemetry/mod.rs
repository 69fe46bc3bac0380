//! Pool observability: counters and latency distribution.

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
