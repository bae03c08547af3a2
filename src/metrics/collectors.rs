//! Metric recording for orchestrator operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods for the events the orchestrator reports. Every method is
//! a no-op until [`init_metrics`](super::init_metrics) has run.

use std::time::Duration;

use super::prometheus::metrics;
use crate::stage::StageKind;
use crate::task::TaskStatus;

/// Why a task ended up `failed`, as used for the failure counter label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// A stage process exited non-zero, could not start, or timed out.
    Stage,
    /// Training finished but produced no artifact.
    MissingArtifact,
    /// An operator cancelled the task.
    Cancelled,
    /// The orchestrator restarted while the task was running.
    Interrupted,
    /// The task store kept rejecting a transition.
    Store,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Stage => "stage",
            FailureCause::MissingArtifact => "missing_artifact",
            FailureCause::Cancelled => "cancelled",
            FailureCause::Interrupted => "interrupted",
            FailureCause::Store => "store",
        }
    }
}

/// Metrics collector for recording orchestrator metrics.
///
/// # Example
///
/// ```ignore
/// use recon_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_transition(TaskStatus::Imaged, "3dgs");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record an applied status transition.
    pub fn record_transition(&self, status: TaskStatus, variant: &str) {
        if let Some(m) = metrics() {
            m.task_transitions_total
                .with_label_values(&[status.as_str(), variant])
                .inc();
        }

        tracing::trace!(status = %status, variant = variant, "Recorded transition metric");
    }

    /// Record a task failure by cause.
    pub fn record_failure(&self, cause: FailureCause) {
        if let Some(m) = metrics() {
            m.task_failures_total.with_label_values(&[cause.as_str()]).inc();
        }
    }

    /// Record how long a stage ran and how it ended.
    ///
    /// `outcome` is one of `success`, `failure`, `cancelled`, `timeout`.
    pub fn record_stage(&self, stage: StageKind, outcome: &str, duration: Duration) {
        if let Some(m) = metrics() {
            m.stage_duration
                .with_label_values(&[stage.as_str(), outcome])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            stage = %stage,
            outcome = outcome,
            duration_secs = duration.as_secs_f64(),
            "Recorded stage metric"
        );
    }

    /// Update the admission gauges.
    pub fn update_admission(&self, queued: usize, active: usize) {
        if let Some(m) = metrics() {
            m.queue_depth.set(queued as f64);
            m.active_slots.set(active as f64);
        }

        tracing::trace!(queued = queued, active = active, "Updated admission metrics");
    }

    pub fn record_cancellation(&self) {
        if let Some(m) = metrics() {
            m.cancellations_total.inc();
        }
    }

    pub fn update_subscribers(&self, count: usize) {
        if let Some(m) = metrics() {
            m.subscribers.set(count as f64);
        }
    }

    pub fn record_dropped_events(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(m) = metrics() {
            m.events_dropped_total.inc_by(count as f64);
        }
    }
}
