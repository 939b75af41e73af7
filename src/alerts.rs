use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::ledger::models::{AuditEntry, AuditEventType};
use crate::ledger::{LedgerStore, SYSTEM_ACTOR};

/// What an operator is being asked to look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Terminal provider error or retries exhausted
    PayoutFailed,
    /// Provider accepted the transfer but the ledger could not record it
    PayoutUnrecorded,
    /// Obligation stuck InFlight past the sweep bound
    InFlightTimeout,
    /// Webhook refers to a transfer the ledger does not know
    OrphanEvent,
    /// Webhook disagrees with the ledger state
    StatusMismatch,
    /// Money reported as distributed was pulled back
    Reversal,
    /// A verified webhook was acknowledged but could not be applied
    WebhookUnprocessed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PayoutFailed => "payout_failed",
            AlertKind::PayoutUnrecorded => "payout_unrecorded",
            AlertKind::InFlightTimeout => "in_flight_timeout",
            AlertKind::OrphanEvent => "orphan_event",
            AlertKind::StatusMismatch => "status_mismatch",
            AlertKind::Reversal => "reversal",
            AlertKind::WebhookUnprocessed => "webhook_unprocessed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub payee_id: Option<String>,
    pub obligation_ids: Vec<Uuid>,
    pub details: serde_json::Value,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payee_id: None,
            obligation_ids: Vec::new(),
            details: serde_json::Value::Null,
        }
    }

    pub fn payee(mut self, payee_id: impl Into<String>) -> Self {
        self.payee_id = Some(payee_id.into());
        self
    }

    pub fn obligations(mut self, ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.obligation_ids = ids.into_iter().collect();
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Operator alert channel
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Logs alerts at error level and keeps a reconciliation entry in the audit log
pub struct TracingAlertSink {
    store: Arc<dyn LedgerStore>,
}

impl TracingAlertSink {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn raise(&self, alert: Alert) {
        error!(
            alert = true,
            kind = alert.kind.as_str(),
            payee_id = alert.payee_id.as_deref().unwrap_or("-"),
            obligations = alert.obligation_ids.len(),
            "🚨 {}",
            alert.message
        );

        let details = json!({
            "kind": alert.kind,
            "message": alert.message,
            "payee_id": alert.payee_id,
            "details": alert.details,
        });

        let entries: Vec<AuditEntry> = if alert.obligation_ids.is_empty() {
            vec![AuditEntry::new(
                AuditEventType::ReconciliationAlert,
                SYSTEM_ACTOR,
                details,
            )]
        } else {
            alert
                .obligation_ids
                .iter()
                .map(|id| {
                    let mut entry =
                        AuditEntry::new(AuditEventType::ReconciliationAlert, SYSTEM_ACTOR, details.clone());
                    entry.obligation_id = Some(*id);
                    entry
                })
                .collect()
        };

        for entry in entries {
            if let Err(e) = self.store.append_audit(&entry).await {
                warn!("⚠️ Failed to persist alert audit entry: {:?}", e);
            }
        }
    }
}
