use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult, LedgerError};
use crate::split::SplitBreakdown;

pub const SYSTEM_ACTOR: &str = "settlement-engine";

/// Result of a transition that is allowed to be replayed
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(SettlementObligation),
    /// The obligation was already in the requested state; nothing changed
    Unchanged(SettlementObligation),
}

impl Transition {
    pub fn obligation(&self) -> &SettlementObligation {
        match self {
            Transition::Applied(o) | Transition::Unchanged(o) => o,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Settlement ledger - owns every obligation status change.
///
/// All transitions go through the store's compare-and-swap, so concurrent
/// callers racing on the same obligation see exactly one winner.
#[derive(Clone)]
pub struct SettlementLedger {
    store: Arc<dyn LedgerStore>,
}

impl SettlementLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    async fn require(&self, id: Uuid) -> AppResult<SettlementObligation> {
        self.store
            .get_obligation(id)
            .await?
            .ok_or_else(|| LedgerError::ObligationNotFound(id).into())
    }

    /// Status compare-and-swap, refused up front when the status table forbids it.
    /// `from == to` is a field update on an unchanged status.
    async fn cas(
        &self,
        id: Uuid,
        from: ObligationStatus,
        to: ObligationStatus,
        change: &StatusChange,
    ) -> AppResult<Option<SettlementObligation>> {
        if from != to && !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition { id, from, to }.into());
        }
        self.store.transition(id, from, to, change).await
    }

    /// Audit writes never undo a transition that already committed
    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(
                event_type = entry.event_type.as_str(),
                "⚠️ Failed to write audit entry: {:?}",
                e
            );
        }
    }

    // ========== CREATION ==========

    /// Create one Pending obligation per payee with a non-zero amount.
    ///
    /// Idempotent: when obligations already exist for the work record and they
    /// agree with the breakdown, the existing set is returned unchanged.
    pub async fn create_obligations(
        &self,
        work_record_id: Uuid,
        breakdown: &SplitBreakdown,
        payees: &PayeeRefs,
    ) -> AppResult<Vec<SettlementObligation>> {
        let requested = requested_obligations(work_record_id, breakdown, payees)?;
        let now = Utc::now();
        let obligations: Vec<SettlementObligation> = requested
            .iter()
            .cloned()
            .map(|new| SettlementObligation::from_new(new, now))
            .collect();

        match self.store.insert_obligations(work_record_id, &obligations).await {
            Ok(()) => {
                info!(
                    "📝 Created {} obligations for work record {}",
                    obligations.len(),
                    work_record_id
                );
                self.audit(
                    AuditEntry::new(
                        AuditEventType::ObligationsCreated,
                        SYSTEM_ACTOR,
                        json!({
                            "obligations": obligations
                                .iter()
                                .map(|o| json!({
                                    "id": o.id,
                                    "role": o.payee_role,
                                    "payee_id": o.payee_id,
                                    "amount": o.amount_owed.to_string(),
                                }))
                                .collect::<Vec<_>>(),
                        }),
                    )
                    .for_work_record(work_record_id),
                )
                .await;
                Ok(obligations)
            }
            Err(AppError::Ledger(LedgerError::DuplicateObligation(_))) => {
                let existing = self.store.obligations_for_record(work_record_id).await?;
                if matches_request(&existing, &requested) {
                    debug!(
                        "Obligations for work record {} already exist, returning existing set",
                        work_record_id
                    );
                    Ok(existing)
                } else {
                    warn!(
                        "⚠️ Existing obligations for work record {} disagree with the breakdown",
                        work_record_id
                    );
                    Err(LedgerError::DuplicateObligation(work_record_id).into())
                }
            }
            Err(e) => Err(e),
        }
    }

    // ========== PAYMENT TRANSITIONS ==========

    /// Pending → InFlight. Exactly one concurrent caller wins.
    pub async fn begin_attempt(&self, id: Uuid) -> AppResult<SettlementObligation> {
        let change = StatusChange {
            attempt_started_at: Some(Some(Utc::now())),
            failure_reason: Some(None),
            increment_attempts: true,
            ..Default::default()
        };

        match self
            .cas(id, ObligationStatus::Pending, ObligationStatus::InFlight, &change)
            .await?
        {
            Some(obligation) => {
                debug!(
                    "Attempt {} started for obligation {} ({})",
                    obligation.attempt_count, obligation.id, obligation.idempotency_key
                );
                self.audit(
                    AuditEntry::new(
                        AuditEventType::AttemptStarted,
                        SYSTEM_ACTOR,
                        json!({
                            "attempt": obligation.attempt_count,
                            "idempotency_key": obligation.idempotency_key,
                        }),
                    )
                    .for_obligation(&obligation),
                )
                .await;
                Ok(obligation)
            }
            None => {
                let current = self.require(id).await?;
                match current.status {
                    ObligationStatus::InFlight => Err(LedgerError::AlreadyInFlight(id).into()),
                    from => Err(LedgerError::InvalidTransition {
                        id,
                        from,
                        to: ObligationStatus::InFlight,
                    }
                    .into()),
                }
            }
        }
    }

    /// Record the batch idempotency key on InFlight obligations before the provider call
    pub async fn assign_batch(&self, ids: &[Uuid], batch_key: &str) -> AppResult<Vec<SettlementObligation>> {
        let change = StatusChange {
            batch_key: Some(Some(batch_key.to_string())),
            ..Default::default()
        };

        let mut assigned = Vec::with_capacity(ids.len());
        for id in ids {
            match self
                .cas(*id, ObligationStatus::InFlight, ObligationStatus::InFlight, &change)
                .await?
            {
                Some(obligation) => {
                    self.audit(
                        AuditEntry::new(
                            AuditEventType::BatchAssigned,
                            SYSTEM_ACTOR,
                            json!({ "batch_key": batch_key }),
                        )
                        .for_obligation(&obligation),
                    )
                    .await;
                    assigned.push(obligation);
                }
                None => {
                    let current = self.require(*id).await?;
                    return Err(LedgerError::InvalidTransition {
                        id: *id,
                        from: current.status,
                        to: ObligationStatus::InFlight,
                    }
                    .into());
                }
            }
        }

        debug!("Batch {} assigned to {} obligations", batch_key, assigned.len());
        Ok(assigned)
    }

    /// InFlight → Paid. Replaying with the same transfer id is a no-op.
    pub async fn mark_paid(
        &self,
        id: Uuid,
        external_transfer_id: &str,
        paid_at: DateTime<Utc>,
    ) -> AppResult<Transition> {
        let change = StatusChange {
            external_transfer_id: Some(Some(external_transfer_id.to_string())),
            paid_at: Some(Some(paid_at)),
            failure_reason: Some(None),
            ..Default::default()
        };

        if let Some(obligation) = self
            .cas(id, ObligationStatus::InFlight, ObligationStatus::Paid, &change)
            .await?
        {
            info!(
                "✅ Obligation {} paid: {} to {} via {}",
                obligation.id, obligation.amount_owed, obligation.payee_id, external_transfer_id
            );
            self.audit(
                AuditEntry::new(
                    AuditEventType::ObligationPaid,
                    SYSTEM_ACTOR,
                    json!({
                        "transfer_id": external_transfer_id,
                        "amount": obligation.amount_owed.to_string(),
                    }),
                )
                .for_obligation(&obligation),
            )
            .await;
            return Ok(Transition::Applied(obligation));
        }

        let current = self.require(id).await?;
        match (current.status, current.external_transfer_id.as_deref()) {
            (ObligationStatus::Paid, Some(existing)) if existing == external_transfer_id => {
                debug!("Obligation {} already paid with {}", id, existing);
                Ok(Transition::Unchanged(current))
            }
            (ObligationStatus::Paid, existing) => Err(LedgerError::TransferMismatch {
                id,
                existing: existing.unwrap_or_default().to_string(),
                attempted: external_transfer_id.to_string(),
            }
            .into()),
            (from, _) => Err(LedgerError::InvalidTransition {
                id,
                from,
                to: ObligationStatus::Paid,
            }
            .into()),
        }
    }

    /// InFlight → Failed. Already Failed is a no-op.
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> AppResult<Transition> {
        let change = StatusChange {
            failure_reason: Some(Some(reason.to_string())),
            ..Default::default()
        };

        if let Some(obligation) = self
            .cas(id, ObligationStatus::InFlight, ObligationStatus::Failed, &change)
            .await?
        {
            warn!(
                "❌ Obligation {} failed after {} attempts: {}",
                obligation.id, obligation.attempt_count, reason
            );
            self.audit(
                AuditEntry::new(
                    AuditEventType::ObligationFailed,
                    SYSTEM_ACTOR,
                    json!({ "reason": reason, "batch_key": obligation.batch_key }),
                )
                .for_obligation(&obligation),
            )
            .await;
            return Ok(Transition::Applied(obligation));
        }

        let current = self.require(id).await?;
        match current.status {
            ObligationStatus::Failed => Ok(Transition::Unchanged(current)),
            from => Err(LedgerError::InvalidTransition {
                id,
                from,
                to: ObligationStatus::Failed,
            }
            .into()),
        }
    }

    /// Failed → Pending, operator only
    pub async fn reset_to_pending(
        &self,
        id: Uuid,
        operator_id: &str,
        justification: &str,
    ) -> AppResult<SettlementObligation> {
        if operator_id.trim().is_empty() {
            return Err(AppError::InvalidInput("operator_id is required".to_string()));
        }
        if justification.trim().is_empty() {
            return Err(AppError::InvalidInput("justification is required".to_string()));
        }

        let previous = self.require(id).await?;
        let change = StatusChange {
            batch_key: Some(None),
            external_transfer_id: Some(None),
            failure_reason: Some(None),
            attempt_started_at: Some(None),
            ..Default::default()
        };

        match self
            .cas(id, ObligationStatus::Failed, ObligationStatus::Pending, &change)
            .await?
        {
            Some(obligation) => {
                info!(
                    operator = operator_id,
                    "🔁 Obligation {} reset to pending", obligation.id
                );
                self.audit(
                    AuditEntry::new(
                        AuditEventType::ObligationReset,
                        operator_id,
                        json!({
                            "justification": justification,
                            "previous_failure_reason": previous.failure_reason,
                        }),
                    )
                    .for_obligation(&obligation),
                )
                .await;
                Ok(obligation)
            }
            None => {
                let current = self.require(id).await?;
                Err(LedgerError::InvalidTransition {
                    id,
                    from: current.status,
                    to: ObligationStatus::Pending,
                }
                .into())
            }
        }
    }

    /// Pending or Failed → Voided, when the owning work record is superseded
    pub async fn void_for_correction(
        &self,
        id: Uuid,
        operator_id: &str,
        reason: &str,
    ) -> AppResult<Transition> {
        let change = StatusChange {
            failure_reason: Some(Some(format!("voided: {}", reason))),
            ..Default::default()
        };

        for from in [ObligationStatus::Pending, ObligationStatus::Failed] {
            if let Some(obligation) = self
                .cas(id, from, ObligationStatus::Voided, &change)
                .await?
            {
                info!("🗑️ Obligation {} voided (was {})", obligation.id, from);
                self.audit(
                    AuditEntry::new(
                        AuditEventType::ObligationVoided,
                        operator_id,
                        json!({ "reason": reason, "previous_status": from }),
                    )
                    .for_obligation(&obligation),
                )
                .await;
                return Ok(Transition::Applied(obligation));
            }
        }

        let current = self.require(id).await?;
        match current.status {
            ObligationStatus::Voided => Ok(Transition::Unchanged(current)),
            from => Err(LedgerError::InvalidTransition {
                id,
                from,
                to: ObligationStatus::Voided,
            }
            .into()),
        }
    }

    /// Compensating entry for a Paid obligation reversed by the provider.
    /// Returns `None` when this event was already recorded.
    pub async fn record_reversal(
        &self,
        id: Uuid,
        transfer_id: &str,
        event_id: &str,
        reason: &str,
    ) -> AppResult<Option<Reversal>> {
        let obligation = self.require(id).await?;
        if obligation.status != ObligationStatus::Paid {
            return Err(AppError::StateConflict(format!(
                "Obligation {} is {}, only paid obligations can be reversed",
                id, obligation.status
            )));
        }

        let reversal = Reversal {
            id: Uuid::new_v4(),
            obligation_id: obligation.id,
            work_record_id: obligation.work_record_id,
            amount: -obligation.amount_owed,
            transfer_id: transfer_id.to_string(),
            event_id: event_id.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };

        if !self.store.insert_reversal(&reversal).await? {
            debug!("Reversal for obligation {} and event {} already recorded", id, event_id);
            return Ok(None);
        }

        warn!(
            "↩️ Reversal of {} recorded for obligation {} ({})",
            obligation.amount_owed, obligation.id, reason
        );
        self.audit(
            AuditEntry::new(
                AuditEventType::ReversalRecorded,
                SYSTEM_ACTOR,
                json!({
                    "reversal_id": reversal.id,
                    "amount": reversal.amount.to_string(),
                    "transfer_id": transfer_id,
                    "event_id": event_id,
                    "reason": reason,
                }),
            )
            .for_obligation(&obligation),
        )
        .await;
        Ok(Some(reversal))
    }

    // ========== QUERIES ==========

    pub async fn get_obligation(&self, id: Uuid) -> AppResult<SettlementObligation> {
        self.require(id).await
    }

    /// Only Pending obligations are outstanding
    pub async fn outstanding_for(&self, payee_id: &str) -> AppResult<Vec<SettlementObligation>> {
        self.store
            .list_obligations(&ObligationFilter {
                payee_id: Some(payee_id.to_string()),
                status: Some(ObligationStatus::Pending),
                ..Default::default()
            })
            .await
    }

    pub async fn list_obligations(&self, filter: &ObligationFilter) -> AppResult<Vec<SettlementObligation>> {
        self.store.list_obligations(filter).await
    }

    pub async fn distribution_summary(&self, work_record_id: Uuid) -> AppResult<DistributionSummary> {
        let record = self
            .store
            .get_work_record(work_record_id)
            .await?
            .ok_or(LedgerError::WorkRecordNotFound(work_record_id))?;
        let obligations = self.store.obligations_for_record(work_record_id).await?;
        let reversals = self.store.reversals_for_record(work_record_id).await?;

        Ok(DistributionSummary::build(&record, &obligations, &reversals))
    }

    pub async fn stale_in_flight(&self, older_than: Duration) -> AppResult<Vec<SettlementObligation>> {
        self.store
            .in_flight_started_before(Utc::now() - older_than)
            .await
    }

    pub async fn payees_with_outstanding(&self) -> AppResult<Vec<String>> {
        self.store.payees_with_outstanding().await
    }

    pub async fn audit_trail(&self, id: Uuid) -> AppResult<Vec<AuditEntry>> {
        self.require(id).await?;
        self.store.audit_for_obligation(id).await
    }
}

fn requested_obligations(
    work_record_id: Uuid,
    breakdown: &SplitBreakdown,
    payees: &PayeeRefs,
) -> AppResult<Vec<NewObligation>> {
    let mut requested = Vec::new();

    for role in PayeeRole::all() {
        let amount = match role {
            PayeeRole::Contractor => breakdown.contractor_earnings,
            PayeeRole::Marketing => breakdown.marketing_payout,
            PayeeRole::Training => breakdown.training_payout,
        };

        if amount < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount).into());
        }
        if amount.is_zero() {
            continue;
        }

        let payee_id = payees.payee_for(role).ok_or_else(|| {
            AppError::InvalidInput(format!("{} amount {} has no payee attached", role, amount))
        })?;

        requested.push(NewObligation {
            work_record_id,
            payee_role: role,
            payee_id: payee_id.to_string(),
            amount_owed: amount,
        });
    }

    Ok(requested)
}

fn matches_request(existing: &[SettlementObligation], requested: &[NewObligation]) -> bool {
    existing.len() == requested.len()
        && requested.iter().all(|new| {
            existing.iter().any(|o| {
                o.payee_role == new.payee_role
                    && o.payee_id == new.payee_id
                    && o.amount_owed == new.amount_owed
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::InMemoryLedgerStore;
    use crate::testing::{insert_record, reference_record};
    use rust_decimal_macros::dec;

    async fn seeded() -> (SettlementLedger, WorkRecord, Vec<SettlementObligation>) {
        let ledger = SettlementLedger::new(Arc::new(InMemoryLedgerStore::new()));
        let record = reference_record("booking-1");
        insert_record(&ledger, &record).await;
        let obligations = ledger
            .create_obligations(record.id, &record.breakdown, &record.payees)
            .await
            .unwrap();
        (ledger, record, obligations)
    }

    fn contractor(obligations: &[SettlementObligation]) -> &SettlementObligation {
        obligations
            .iter()
            .find(|o| o.payee_role == PayeeRole::Contractor)
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_obligations_one_per_payee() {
        let (_, record, obligations) = seeded().await;

        assert_eq!(obligations.len(), 3);
        assert!(obligations.iter().all(|o| o.status == ObligationStatus::Pending));
        assert_eq!(contractor(&obligations).amount_owed, dec!(217.00));
        assert_eq!(
            obligations.iter().map(|o| o.amount_owed).sum::<Decimal>() + record.breakdown.agency_retained,
            record.breakdown.client_charge
        );
    }

    #[tokio::test]
    async fn test_create_obligations_is_idempotent() {
        let (ledger, record, first) = seeded().await;

        let second = ledger
            .create_obligations(record.id, &record.breakdown, &record.payees)
            .await
            .unwrap();

        let mut first_ids: Vec<Uuid> = first.iter().map(|o| o.id).collect();
        let mut second_ids: Vec<Uuid> = second.iter().map(|o| o.id).collect();
        first_ids.sort();
        second_ids.sort();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn test_create_obligations_conflicting_amounts() {
        let (ledger, record, _) = seeded().await;

        let mut changed = record.breakdown;
        changed.contractor_earnings = dec!(1.00);
        let err = ledger
            .create_obligations(record.id, &changed, &record.payees)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::DuplicateObligation(_))));
    }

    #[tokio::test]
    async fn test_zero_amount_roles_are_skipped() {
        let ledger = SettlementLedger::new(Arc::new(InMemoryLedgerStore::new()));
        let mut record = reference_record("booking-2");
        record.payees.training_center_id = None;
        record.breakdown.agency_retained += record.breakdown.training_payout;
        record.breakdown.training_payout = Decimal::ZERO;
        insert_record(&ledger, &record).await;

        let obligations = ledger
            .create_obligations(record.id, &record.breakdown, &record.payees)
            .await
            .unwrap();
        assert_eq!(obligations.len(), 2);
        assert!(obligations.iter().all(|o| o.payee_role != PayeeRole::Training));
    }

    #[tokio::test]
    async fn test_begin_attempt_has_one_winner() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.begin_attempt(id).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(o) => {
                    winners += 1;
                    assert_eq!(o.status, ObligationStatus::InFlight);
                    assert_eq!(o.attempt_count, 1);
                }
                Err(e) => assert!(matches!(e, AppError::Ledger(LedgerError::AlreadyInFlight(_)))),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_begin_attempt_on_paid_is_invalid() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;

        ledger.begin_attempt(id).await.unwrap();
        ledger.mark_paid(id, "tr_1", Utc::now()).await.unwrap();

        let err = ledger.begin_attempt(id).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InvalidTransition {
                from: ObligationStatus::Paid,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_mark_paid_same_transfer_is_noop() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;

        ledger.begin_attempt(id).await.unwrap();
        let first = ledger.mark_paid(id, "tr_1", Utc::now()).await.unwrap();
        assert!(first.was_applied());

        let second = ledger.mark_paid(id, "tr_1", Utc::now()).await.unwrap();
        assert!(!second.was_applied());
        assert_eq!(second.obligation().paid_at, first.obligation().paid_at);
    }

    #[tokio::test]
    async fn test_mark_paid_different_transfer_is_error() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;

        ledger.begin_attempt(id).await.unwrap();
        ledger.mark_paid(id, "tr_1", Utc::now()).await.unwrap();

        let err = ledger.mark_paid(id, "tr_2", Utc::now()).await.unwrap_err();
        assert!(matches!(err, AppError::Ledger(LedgerError::TransferMismatch { .. })));

        let stored = ledger.get_obligation(id).await.unwrap();
        assert_eq!(stored.external_transfer_id.as_deref(), Some("tr_1"));
    }

    #[tokio::test]
    async fn test_mark_paid_requires_in_flight() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;

        let err = ledger.mark_paid(id, "tr_1", Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InvalidTransition {
                from: ObligationStatus::Pending,
                to: ObligationStatus::Paid,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_failed_is_not_outstanding_until_reset() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;
        let payee = contractor(&obligations).payee_id.clone();

        ledger.begin_attempt(id).await.unwrap();
        ledger.mark_failed(id, "account_invalid").await.unwrap();

        let failed = ledger.get_obligation(id).await.unwrap();
        assert_eq!(failed.status, ObligationStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("account_invalid"));
        assert!(ledger.outstanding_for(&payee).await.unwrap().is_empty());

        let err = ledger.reset_to_pending(id, "ops-1", "  ").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));

        let reset = ledger
            .reset_to_pending(id, "ops-1", "account fixed by payee")
            .await
            .unwrap();
        assert_eq!(reset.status, ObligationStatus::Pending);
        assert_eq!(ledger.outstanding_for(&payee).await.unwrap().len(), 1);

        let trail = ledger.audit_trail(id).await.unwrap();
        let reset_entry = trail
            .iter()
            .find(|e| e.event_type == AuditEventType::ObligationReset)
            .unwrap();
        assert_eq!(reset_entry.actor, "ops-1");
    }

    #[tokio::test]
    async fn test_void_and_reversal_rules() {
        let (ledger, record, obligations) = seeded().await;
        let paid_id = contractor(&obligations).id;
        let pending_id = obligations
            .iter()
            .find(|o| o.payee_role == PayeeRole::Marketing)
            .unwrap()
            .id;

        ledger.begin_attempt(paid_id).await.unwrap();
        ledger.mark_paid(paid_id, "tr_1", Utc::now()).await.unwrap();

        assert!(ledger.void_for_correction(paid_id, "ops", "fix").await.is_err());
        assert!(ledger
            .void_for_correction(pending_id, "ops", "fix")
            .await
            .unwrap()
            .was_applied());
        assert!(ledger.record_reversal(pending_id, "tr_1", "evt_1", "x").await.is_err());

        let reversal = ledger
            .record_reversal(paid_id, "tr_1", "evt_1", "chargeback")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reversal.amount, dec!(-217.00));
        assert!(ledger
            .record_reversal(paid_id, "tr_1", "evt_1", "chargeback")
            .await
            .unwrap()
            .is_none());

        let summary = ledger.distribution_summary(record.id).await.unwrap();
        assert!(summary.is_balanced());
        assert_eq!(summary.paid, dec!(217.00));
        assert_eq!(summary.distributed(), Decimal::ZERO);
        assert_eq!(summary.voided, dec!(7.75));
        // still Paid; history is never rewritten
        assert_eq!(
            ledger.get_obligation(paid_id).await.unwrap().status,
            ObligationStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_stale_in_flight() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;
        ledger.begin_attempt(id).await.unwrap();

        assert!(ledger.stale_in_flight(Duration::minutes(10)).await.unwrap().is_empty());
        let stale = ledger.stale_in_flight(Duration::seconds(-1)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);
    }

    #[tokio::test]
    async fn test_forbidden_transition_never_reaches_store() {
        let (ledger, _, obligations) = seeded().await;
        let id = contractor(&obligations).id;

        let err = ledger
            .cas(id, ObligationStatus::Pending, ObligationStatus::Paid, &StatusChange::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InvalidTransition {
                from: ObligationStatus::Pending,
                to: ObligationStatus::Paid,
                ..
            })
        ));
        assert_eq!(
            ledger.get_obligation(id).await.unwrap().status,
            ObligationStatus::Pending
        );
    }
}
