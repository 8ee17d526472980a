//! Prometheus metrics.
//!
//! Every metric is registered once in the process-wide default registry and recorded through the
//! free functions re-exported here. [`render`] serves them at `/internal/metrics`.

mod credits;
mod optimize;

pub use credits::{record_credit_charged, record_credit_refunded, record_reconciliation};
#[cfg(test)]
pub use credits::reconciliation_events;
pub use optimize::{record_description_fallback, record_optimization, record_transcode_duration};

use prometheus::{Encoder, TextEncoder};

/// Text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
