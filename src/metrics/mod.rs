//! Metrics module for Prometheus-based monitoring.
//!
//! Covers status transitions, failures by cause, stage durations, admission
//! gauges, cancellations and event subscribers.
//!
//! # Example
//!
//! ```ignore
//! use recon_forge::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.update_admission(2, 1);
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{FailureCause, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, metrics, Metrics};
