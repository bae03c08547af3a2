//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by recon-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// The registry and every metric registered in it.
///
/// Installed as one unit, so recorded series always land in the registry
/// that gets exported.
pub struct Metrics {
    pub registry: Registry,
    /// Status transitions applied, labeled by target status and variant.
    pub task_transitions_total: CounterVec,
    /// Failed tasks, labeled by failure cause.
    pub task_failures_total: CounterVec,
    /// Stage wall-clock duration in seconds, labeled by stage and outcome.
    pub stage_duration: HistogramVec,
    /// Number of tasks waiting for a slot.
    pub queue_depth: Gauge,
    /// Number of tasks holding a slot.
    pub active_slots: Gauge,
    /// Total cancellation requests that hit a non-terminal task.
    pub cancellations_total: Counter,
    /// Number of connected event subscribers.
    pub subscribers: Gauge,
    /// Events not delivered because a subscriber queue was full or closed.
    pub events_dropped_total: Counter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn build() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Task metrics
        let task_transitions_total = CounterVec::new(
            Opts::new(
                "recon_forge_task_transitions_total",
                "Total task status transitions applied",
            ),
            &["status", "variant"],
        )?;

        let task_failures_total = CounterVec::new(
            Opts::new("recon_forge_task_failures_total", "Total failed tasks by cause"),
            &["cause"],
        )?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "recon_forge_stage_duration_seconds",
                "Stage process duration in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]),
            &["stage", "outcome"],
        )?;

        // Admission metrics
        let queue_depth = Gauge::new("recon_forge_queue_depth", "Tasks waiting for a slot")?;
        let active_slots = Gauge::new("recon_forge_active_slots", "Tasks holding a slot")?;

        let cancellations_total = Counter::new(
            "recon_forge_cancellations_total",
            "Total cancellations of non-terminal tasks",
        )?;

        // Event metrics
        let subscribers = Gauge::new("recon_forge_subscribers", "Connected event subscribers")?;

        let events_dropped_total = Counter::new(
            "recon_forge_events_dropped_total",
            "Events not delivered to a subscriber",
        )?;

        registry.register(Box::new(task_transitions_total.clone()))?;
        registry.register(Box::new(task_failures_total.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_slots.clone()))?;
        registry.register(Box::new(cancellations_total.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(events_dropped_total.clone()))?;

        Ok(Self {
            registry,
            task_transitions_total,
            task_failures_total,
            stage_duration,
            queue_depth,
            active_slots,
            cancellations_total,
            subscribers,
            events_dropped_total,
        })
    }
}

/// The installed metrics, if [`init_metrics`] has run.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once and from several threads; only one set of
/// metrics is ever installed.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let built = Metrics::build()?;
    // A concurrent initializer may have won; its set stays in place whole
    let _ = METRICS.get_or_init(|| built);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(metrics) = METRICS.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
