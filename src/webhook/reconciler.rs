use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::events::{EventKind, ProviderEvent};
use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::error::{AppError, AppResult, LedgerError};
use crate::ledger::models::{ObligationStatus, SettlementObligation};
use crate::ledger::SettlementLedger;
use std::sync::Arc;

/// What one webhook delivery did to the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub event_id: String,
    /// Already processed inside the dedup window
    pub duplicate: bool,
    /// Event type we do not act on
    pub ignored: bool,
    /// No obligation matched the transfer
    pub orphan: bool,
    pub paid: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub reversed: Vec<Uuid>,
    pub unchanged: Vec<Uuid>,
    pub mismatched: Vec<Uuid>,
}

impl ReconcileOutcome {
    fn new(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            ..Default::default()
        }
    }

    pub fn changed_ledger(&self) -> bool {
        !(self.paid.is_empty() && self.failed.is_empty() && self.reversed.is_empty())
    }
}

/// Webhook reconciler - applies verified provider events to the ledger
pub struct WebhookReconciler {
    ledger: SettlementLedger,
    alerts: Arc<dyn AlertSink>,
    dedup_window: Duration,
}

impl WebhookReconciler {
    pub fn new(ledger: SettlementLedger, alerts: Arc<dyn AlertSink>, dedup_window: Duration) -> Self {
        Self {
            ledger,
            alerts,
            dedup_window,
        }
    }

    /// Process one event at most once per dedup window.
    ///
    /// The claim is released when processing errors, so the event can be replayed.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn handle(&self, event: &ProviderEvent) -> AppResult<ReconcileOutcome> {
        let now = Utc::now();
        let store = self.ledger.store();

        if !store
            .claim_event(&event.id, now, now - self.dedup_window)
            .await?
        {
            debug!("Event {} already processed, skipping", event.id);
            let mut outcome = ReconcileOutcome::new(&event.id);
            outcome.duplicate = true;
            return Ok(outcome);
        }

        match self.process(event, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!("⚠️ Event {} failed, releasing claim: {:?}", event.id, e);
                if let Err(release_error) = store.release_event(&event.id).await {
                    warn!("⚠️ Could not release event {}: {:?}", event.id, release_error);
                }
                Err(e)
            }
        }
    }

    async fn process(&self, event: &ProviderEvent, now: DateTime<Utc>) -> AppResult<ReconcileOutcome> {
        match event.kind() {
            EventKind::TransferSucceeded => self.on_succeeded(event, now).await,
            EventKind::TransferFailed | EventKind::TransferReversed => self.on_failed_or_reversed(event).await,
            EventKind::Unknown => {
                debug!("Ignoring event type {}", event.event_type);
                let mut outcome = ReconcileOutcome::new(&event.id);
                outcome.ignored = true;
                Ok(outcome)
            }
        }
    }

    /// Match by transfer id first, then by the batch idempotency key
    async fn matching(&self, event: &ProviderEvent) -> AppResult<Vec<SettlementObligation>> {
        let store = self.ledger.store();

        if let Some(transfer_id) = &event.data.transfer_id {
            let found = store.find_by_transfer_id(transfer_id).await?;
            if !found.is_empty() {
                return Ok(found);
            }
        }

        match &event.data.idempotency_key {
            Some(batch_key) => store.find_by_batch_key(batch_key).await,
            None => Ok(Vec::new()),
        }
    }

    async fn orphan(&self, event: &ProviderEvent) -> ReconcileOutcome {
        self.alerts
            .raise(
                Alert::new(
                    AlertKind::OrphanEvent,
                    format!("Event {} ({}) matches no obligation", event.id, event.event_type),
                )
                .details(json!({
                    "event_id": event.id,
                    "transfer_id": event.data.transfer_id,
                    "idempotency_key": event.data.idempotency_key,
                })),
            )
            .await;

        let mut outcome = ReconcileOutcome::new(&event.id);
        outcome.orphan = true;
        outcome
    }

    async fn mismatch(&self, event: &ProviderEvent, obligations: &[SettlementObligation]) {
        if obligations.is_empty() {
            return;
        }

        self.alerts
            .raise(
                Alert::new(
                    AlertKind::StatusMismatch,
                    format!(
                        "Event {} ({}) disagrees with the ledger for {} obligations",
                        event.id,
                        event.event_type,
                        obligations.len()
                    ),
                )
                .obligations(obligations.iter().map(|o| o.id))
                .details(json!({
                    "event_id": event.id,
                    "transfer_id": event.data.transfer_id,
                    "ledger": obligations
                        .iter()
                        .map(|o| json!({
                            "id": o.id,
                            "status": o.status,
                            "transfer_id": o.external_transfer_id,
                        }))
                        .collect::<Vec<_>>(),
                })),
            )
            .await;
    }

    async fn on_succeeded(&self, event: &ProviderEvent, now: DateTime<Utc>) -> AppResult<ReconcileOutcome> {
        let obligations = self.matching(event).await?;
        let transfer_id = match &event.data.transfer_id {
            Some(id) if !obligations.is_empty() => id.clone(),
            _ => return Ok(self.orphan(event).await),
        };

        let mut outcome = ReconcileOutcome::new(&event.id);
        let mut mismatched = Vec::new();

        for obligation in obligations {
            match obligation.status {
                ObligationStatus::InFlight => {
                    match self.ledger.mark_paid(obligation.id, &transfer_id, now).await {
                        Ok(t) if t.was_applied() => outcome.paid.push(obligation.id),
                        Ok(_) => outcome.unchanged.push(obligation.id),
                        // lost a race with another writer; re-read for the alert
                        Err(AppError::Ledger(LedgerError::InvalidTransition { .. }))
                        | Err(AppError::Ledger(LedgerError::TransferMismatch { .. })) => {
                            mismatched.push(self.ledger.get_obligation(obligation.id).await?);
                        }
                        Err(e) => return Err(e),
                    }
                }
                ObligationStatus::Paid
                    if obligation.external_transfer_id.as_deref() == Some(transfer_id.as_str()) =>
                {
                    outcome.unchanged.push(obligation.id);
                }
                _ => mismatched.push(obligation),
            }
        }

        self.mismatch(event, &mismatched).await;
        outcome.mismatched = mismatched.iter().map(|o| o.id).collect();

        if !outcome.paid.is_empty() {
            info!(
                "✅ Webhook confirmed transfer {} for {} obligations",
                transfer_id,
                outcome.paid.len()
            );
        }
        Ok(outcome)
    }

    async fn on_failed_or_reversed(&self, event: &ProviderEvent) -> AppResult<ReconcileOutcome> {
        let obligations = self.matching(event).await?;
        if obligations.is_empty() {
            return Ok(self.orphan(event).await);
        }

        let reason = event.failure_reason();
        let mut outcome = ReconcileOutcome::new(&event.id);
        let mut mismatched = Vec::new();

        for obligation in obligations {
            match obligation.status {
                ObligationStatus::Paid => {
                    let transfer_id = event
                        .data
                        .transfer_id
                        .clone()
                        .or_else(|| obligation.external_transfer_id.clone())
                        .unwrap_or_default();

                    match self
                        .ledger
                        .record_reversal(obligation.id, &transfer_id, &event.id, &reason)
                        .await?
                    {
                        Some(_) => outcome.reversed.push(obligation.id),
                        None => outcome.unchanged.push(obligation.id),
                    }
                }
                ObligationStatus::InFlight => {
                    match self.ledger.mark_failed(obligation.id, &reason).await {
                        Ok(t) if t.was_applied() => outcome.failed.push(obligation.id),
                        Ok(_) => outcome.unchanged.push(obligation.id),
                        Err(AppError::Ledger(LedgerError::InvalidTransition { .. })) => {
                            mismatched.push(self.ledger.get_obligation(obligation.id).await?);
                        }
                        Err(e) => return Err(e),
                    }
                }
                ObligationStatus::Failed => outcome.unchanged.push(obligation.id),
                ObligationStatus::Pending | ObligationStatus::Voided => mismatched.push(obligation),
            }
        }

        if !outcome.reversed.is_empty() {
            self.alerts
                .raise(
                    Alert::new(
                        AlertKind::Reversal,
                        format!(
                            "Paid transfer reversed for {} obligations: {}",
                            outcome.reversed.len(),
                            reason
                        ),
                    )
                    .obligations(outcome.reversed.iter().copied())
                    .details(json!({ "event_id": event.id, "transfer_id": event.data.transfer_id })),
                )
                .await;
        }

        if !outcome.failed.is_empty() {
            self.alerts
                .raise(
                    Alert::new(
                        AlertKind::PayoutFailed,
                        format!(
                            "Provider reported failure for {} in-flight obligations: {}",
                            outcome.failed.len(),
                            reason
                        ),
                    )
                    .obligations(outcome.failed.iter().copied())
                    .details(json!({ "event_id": event.id, "transfer_id": event.data.transfer_id })),
                )
                .await;
        }

        self.mismatch(event, &mismatched).await;
        outcome.mismatched = mismatched.iter().map(|o| o.id).collect();
        Ok(outcome)
    }
}
