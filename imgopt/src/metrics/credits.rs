//! Credit ledger metrics for Prometheus.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, register_int_counter, register_int_counter_vec};

use crate::quota::ReconciliationKind;

/// Credits taken from user balances
static CREDITS_CHARGED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("imgopt_credits_charged_total", "Total credits charged for optimisations")
        .expect("Failed to register imgopt_credits_charged_total metric")
});

/// Credits handed back after a failed or abandoned request
static CREDITS_REFUNDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("imgopt_credits_refunded_total", "Total credits refunded for failed optimisations")
        .expect("Failed to register imgopt_credits_refunded_total metric")
});

static RECONCILIATION_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "imgopt_quota_reconciliation_events_total",
        "Billing inconsistencies that need manual reconciliation",
        &["kind"]
    )
    .expect("Failed to register imgopt_quota_reconciliation_events_total metric")
});

pub fn record_credit_charged() {
    CREDITS_CHARGED.inc();
}

pub fn record_credit_refunded() {
    CREDITS_REFUNDED.inc();
}

pub fn record_reconciliation(kind: ReconciliationKind) {
    RECONCILIATION_EVENTS.with_label_values(&[kind.as_str()]).inc();
}

#[cfg(test)]
pub fn reconciliation_events(kind: ReconciliationKind) -> u64 {
    RECONCILIATION_EVENTS.with_label_values(&[kind.as_str()]).get()
}
