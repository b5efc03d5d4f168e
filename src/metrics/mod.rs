//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks resolved items per stage and outcome, remote call volume and
//! latency, backoff retries, checkpoint saves and batch polling.
//!
//! # Example
//!
//! ```ignore
//! use puzzle_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_item("verify", "success");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TokenUsage};
pub use self::prometheus::{export_metrics, init_metrics, write_metrics};
