use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::spawn;
use tracing::{error, info};

use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::error::AppResult;
use crate::webhook::{ProviderEvent, ReconcileOutcome, WebhookReconciler};

/// Webhook response - return 202 Accepted immediately
#[derive(Debug, Serialize)]
pub struct WebhookAcceptedResponse {
    pub status: String,
    pub message: String,
    pub event_id: String,
}

/// Async webhook processor - reconciles verified events without blocking the provider
pub struct AsyncWebhookProcessor {
    reconciler: Arc<WebhookReconciler>,
    alerts: Arc<dyn AlertSink>,
}

impl AsyncWebhookProcessor {
    pub fn new(reconciler: Arc<WebhookReconciler>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { reconciler, alerts }
    }

    /// Accept the event and return immediately; reconciliation runs in the background.
    ///
    /// The provider has its 2xx by then and will not redeliver. A failed
    /// reconciliation raises a `WebhookUnprocessed` alert carrying the full event,
    /// and its dedup claim is released so the event can be replayed.
    pub fn process_webhook_async(&self, event: ProviderEvent) -> WebhookAcceptedResponse {
        let reconciler = self.reconciler.clone();
        let alerts = self.alerts.clone();
        let event_id = event.id.clone();

        spawn(async move {
            match reconciler.handle(&event).await {
                Ok(outcome) => log_outcome(&outcome),
                Err(e) => {
                    error!("❌ Webhook processing error for {}: {:?}", event.id, e);
                    alerts
                        .raise(
                            Alert::new(
                                AlertKind::WebhookUnprocessed,
                                format!("Webhook {} ({}) could not be applied: {}", event.id, event.event_type, e),
                            )
                            .details(json!({
                                "event_id": event.id,
                                "error": e.to_string(),
                                "event": event,
                            })),
                        )
                        .await;
                }
            }
        });

        WebhookAcceptedResponse {
            status: "accepted".to_string(),
            message: "Webhook received and queued for processing".to_string(),
            event_id,
        }
    }

    /// Reconcile inline, for callers that need the outcome
    pub async fn process_now(&self, event: &ProviderEvent) -> AppResult<ReconcileOutcome> {
        let outcome = self.reconciler.handle(event).await?;
        log_outcome(&outcome);
        Ok(outcome)
    }
}

fn log_outcome(outcome: &ReconcileOutcome) {
    if outcome.duplicate {
        info!("⏭️ Webhook {} already processed", outcome.event_id);
    } else {
        info!(
            paid = outcome.paid.len(),
            failed = outcome.failed.len(),
            reversed = outcome.reversed.len(),
            mismatched = outcome.mismatched.len(),
            orphan = outcome.orphan,
            "✓ Webhook processed: {}",
            outcome.event_id
        );
    }
}
