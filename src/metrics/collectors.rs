//! Recording helpers for pipeline metrics.
//!
//! Each helper silently does nothing until [`super::init_metrics`] has run.

use super::prometheus::{
    COMPOSITE_SCORE, JOBS_IN_PROGRESS, JUDGE_REQUESTS_TOTAL, JUDGMENT_CACHE_LOOKUPS_TOTAL,
    SANDBOX_DURATION, SANDBOX_EXECUTIONS_TOTAL,
};

/// Records one sandbox execution.
///
/// # Arguments
///
/// * `runtime` - Runtime kind ("docker", "local", or "none" when no process ran)
/// * `outcome` - Outcome label (e.g. "success", "timeout", "entry_missing")
/// * `duration_secs` - Wall-clock duration in seconds
pub fn record_sandbox_execution(runtime: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = SANDBOX_EXECUTIONS_TOTAL.get() {
        counter.with_label_values(&[runtime, outcome]).inc();
    }
    if let Some(histogram) = SANDBOX_DURATION.get() {
        histogram.with_label_values(&[runtime]).observe(duration_secs);
    }
}

/// Records one judge request and how it resolved ("ok", "parse_error", "api_error").
pub fn record_judge_request(rubric: &str, status: &str) {
    if let Some(counter) = JUDGE_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[rubric, status]).inc();
    }
}

/// Records a judgment cache lookup.
pub fn record_cache_lookup(hit: bool) {
    if let Some(counter) = JUDGMENT_CACHE_LOOKUPS_TOTAL.get() {
        counter
            .with_label_values(&[if hit { "hit" } else { "miss" }])
            .inc();
    }
}

/// Records a finished report's composite score.
pub fn record_composite_score(score: f64) {
    if let Some(histogram) = COMPOSITE_SCORE.get() {
        histogram.observe(score);
    }
}

/// Marks a background job as started.
pub fn job_started() {
    if let Some(gauge) = JOBS_IN_PROGRESS.get() {
        gauge.inc();
    }
}

/// Marks a background job as finished.
pub fn job_finished() {
    if let Some(gauge) = JOBS_IN_PROGRESS.get() {
        gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_never_panics() {
        record_sandbox_execution("local", "timeout", 1.0);
        record_judge_request("safety", "api_error");
        record_cache_lookup(true);
        record_composite_score(76.5);
        job_started();
        job_finished();
    }
}
