//! Prometheus metrics registration and export.
//!
//! All metrics live in process-wide `OnceLock` statics. Recording before
//! [`init_metrics`] has run is a no-op, so library code can record
//! unconditionally.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all evaluator metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Sandbox executions, labeled by runtime and outcome.
pub static SANDBOX_EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sandbox execution wall-clock duration in seconds, labeled by runtime.
pub static SANDBOX_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Judge requests, labeled by rubric and status.
pub static JUDGE_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Judgment cache lookups, labeled by result (hit/miss).
pub static JUDGMENT_CACHE_LOOKUPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Background evaluation jobs currently running.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Distribution of composite scores (0-100).
pub static COMPOSITE_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let sandbox_executions_total = CounterVec::new(
        Opts::new(
            "agent_eval_sandbox_executions_total",
            "Total sandbox executions",
        ),
        &["runtime", "outcome"],
    )?;

    let sandbox_duration = HistogramVec::new(
        HistogramOpts::new(
            "agent_eval_sandbox_duration_seconds",
            "Sandbox execution duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["runtime"],
    )?;

    let judge_requests_total = CounterVec::new(
        Opts::new("agent_eval_judge_requests_total", "Total judge requests"),
        &["rubric", "status"],
    )?;

    let cache_lookups_total = CounterVec::new(
        Opts::new(
            "agent_eval_judgment_cache_lookups_total",
            "Judgment cache lookups",
        ),
        &["result"],
    )?;

    let jobs_in_progress = Gauge::new(
        "agent_eval_jobs_in_progress",
        "Background evaluation jobs currently running",
    )?;

    let composite_score = Histogram::with_opts(
        HistogramOpts::new("agent_eval_composite_score", "Distribution of composite scores")
            .buckets(vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]),
    )?;

    registry.register(Box::new(sandbox_executions_total.clone()))?;
    registry.register(Box::new(sandbox_duration.clone()))?;
    registry.register(Box::new(judge_requests_total.clone()))?;
    registry.register(Box::new(cache_lookups_total.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(composite_score.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = SANDBOX_EXECUTIONS_TOTAL.set(sandbox_executions_total);
    let _ = SANDBOX_DURATION.set(sandbox_duration);
    let _ = JUDGE_REQUESTS_TOTAL.set(judge_requests_total);
    let _ = JUDGMENT_CACHE_LOOKUPS_TOTAL.set(cache_lookups_total);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = COMPOSITE_SCORE.set(composite_score);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
