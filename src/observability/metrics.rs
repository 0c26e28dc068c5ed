use std::sync::Arc;

use prometheus::{
    Counter, Gauge, Histogram, HistogramOpts, HistogramVec, Registry,
    register_counter_with_registry, register_gauge_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry,
};

const STAGE_BUCKETS: &[f64] = &[0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0];

#[derive(Debug, Clone)]
pub struct Metrics {
    // Counters
    pub runs_completed: Counter,
    pub runs_failed: Counter,
    pub stage_retries: Counter,
    pub streaming_rows_merged: Counter,
    pub embeddings_published: Counter,
    pub recommendations_published: Counter,

    // Histograms
    pub stage_duration: HistogramVec,
    pub run_duration: Histogram,

    // Gauges
    pub active_runs: Gauge,
}

impl Metrics {
    /// # Errors
    /// Fails when a collector with the same name is already registered.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            runs_completed: register_counter_with_registry!(
                "recsys_runs_completed_total",
                "Pipeline runs that finished successfully",
                registry
            )?,
            runs_failed: register_counter_with_registry!(
                "recsys_runs_failed_total",
                "Pipeline runs that failed",
                registry
            )?,
            stage_retries: register_counter_with_registry!(
                "recsys_stage_retries_total",
                "Stage attempts repeated after a retryable failure",
                registry
            )?,
            streaming_rows_merged: register_counter_with_registry!(
                "recsys_streaming_rows_merged_total",
                "Streaming correction rows appended to batch tables",
                registry
            )?,
            embeddings_published: register_counter_with_registry!(
                "recsys_embeddings_published_total",
                "Item and user embeddings pushed to the feature store",
                registry
            )?,
            recommendations_published: register_counter_with_registry!(
                "recsys_recommendations_published_total",
                "Per-user recommendation lists pushed to the feature store",
                registry
            )?,
            stage_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "recsys_stage_duration_seconds",
                    "Duration of one pipeline stage"
                )
                .buckets(STAGE_BUCKETS.to_vec()),
                &["stage"],
                registry
            )?,
            run_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "recsys_run_duration_seconds",
                    "Duration of a full pipeline run"
                )
                .buckets(STAGE_BUCKETS.to_vec()),
                registry
            )?,
            active_runs: register_gauge_with_registry!(
                "recsys_active_runs",
                "Pipeline runs currently executing",
                registry
            )?,
        })
    }
}
