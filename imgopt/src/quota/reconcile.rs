use serde::Serialize;
use tracing::error;

use crate::metrics;
use crate::types::{RequestId, UserId};

/// Billing state that could not be made consistent automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    /// Work was delivered but the charge was not recorded.
    CommitFailed,
    /// A failed or abandoned request kept a credit it should have returned.
    RefundFailed,
}

impl ReconciliationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationKind::CommitFailed => "commit_failed",
            ReconciliationKind::RefundFailed => "refund_failed",
        }
    }
}

/// Emitted on the `imgopt::reconciliation` tracing target so operators can route these to a
/// dedicated sink.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationEvent {
    pub kind: ReconciliationKind,
    pub user_id: UserId,
    pub request_id: Option<RequestId>,
    pub reason: String,
}

impl ReconciliationEvent {
    pub fn new(kind: ReconciliationKind, user_id: UserId, request_id: Option<RequestId>, reason: String) -> Self {
        Self {
            kind,
            user_id,
            request_id,
            reason,
        }
    }

    pub fn emit(&self) {
        error!(
            target: "imgopt::reconciliation",
            kind = self.kind.as_str(),
            user_id = %self.user_id,
            request_id = ?self.request_id,
            reason = %self.reason,
            "billing reconciliation required"
        );
        metrics::record_reconciliation(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_emitted_event_is_counted_by_kind() {
        ReconciliationEvent::new(
            ReconciliationKind::RefundFailed,
            Uuid::new_v4(),
            Some(Uuid::new_v4()),
            "store unavailable".to_string(),
        )
        .emit();

        let text = crate::metrics::render();
        assert!(text.contains("imgopt_quota_reconciliation_events_total{kind=\"refund_failed\"}"));
    }

    #[test]
    fn test_kind_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_value(ReconciliationKind::CommitFailed).unwrap(),
            serde_json::json!("commit_failed")
        );
    }
}
