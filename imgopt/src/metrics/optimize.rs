//! Pipeline metrics for Prometheus.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec};

use crate::describe::FallbackReason;
use crate::transcode::TargetFormat;

/// Optimisation requests by final outcome (`succeeded`, `insufficient_credits`, ...)
static OPTIMIZATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("imgopt_optimizations_total", "Optimisation requests by outcome", &["outcome"])
        .expect("Failed to register imgopt_optimizations_total metric")
});

static DESCRIPTION_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "imgopt_description_fallbacks_total",
        "Responses that carried the fallback description, by reason",
        &["reason"]
    )
    .expect("Failed to register imgopt_description_fallbacks_total metric")
});

/// Buckets: 10ms .. 10s
static TRANSCODE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "imgopt_transcode_duration_seconds",
        "Time spent resizing and encoding one output",
        &["format"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register imgopt_transcode_duration_seconds metric")
});

pub fn record_optimization(outcome: &str) {
    OPTIMIZATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_description_fallback(reason: FallbackReason) {
    DESCRIPTION_FALLBACKS.with_label_values(&[reason.as_str()]).inc();
}

pub fn record_transcode_duration(format: TargetFormat, elapsed: Duration) {
    let format = format.to_string();
    TRANSCODE_DURATION_SECONDS
        .with_label_values(&[format.as_str()])
        .observe(elapsed.as_secs_f64());
}
