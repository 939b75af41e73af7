use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::lanes::PayeeLanes;
use super::retry::RetryPolicy;
use crate::alerts::{Alert, AlertKind, AlertSink};
use crate::error::{AppError, AppResult, LedgerError};
use crate::ledger::models::SettlementObligation;
use crate::ledger::SettlementLedger;
use crate::provider::{
    ErrorClass, ErrorClassifier, PaymentProvider, ProviderError, TransferReceipt, TransferRequest,
};

/// What happened to one settlement batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Paid {
        payee_id: String,
        transfer_id: String,
        batch_key: String,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
        obligation_ids: Vec<Uuid>,
        provider_calls: u32,
    },
    Failed {
        payee_id: String,
        batch_key: String,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
        obligation_ids: Vec<Uuid>,
        reason: String,
        provider_calls: u32,
    },
    /// Provider accepted the transfer but the ledger could not record it;
    /// the obligations stay InFlight until a webhook confirms them.
    Unrecorded {
        payee_id: String,
        transfer_id: String,
        batch_key: String,
        obligation_ids: Vec<Uuid>,
    },
}

impl SettlementOutcome {
    pub fn is_paid(&self) -> bool {
        matches!(self, SettlementOutcome::Paid { .. })
    }
}

/// Failure reason for claimed obligations whose transfer was never issued
pub const ABANDONED_REASON: &str = "abandoned";

/// Batch idempotency key: SHA-256 over the sorted `id:attempt` pairs.
///
/// Stable across retries of one attempt. An attempt after a reset gets a new key.
pub fn batch_key_for(claimed: &[SettlementObligation]) -> String {
    let mut parts: Vec<String> = claimed
        .iter()
        .map(|o| format!("{}:{}", o.id, o.attempt_count))
        .collect();
    parts.sort();

    let mut hasher = Sha256::new();
    hasher.update(parts.join(",").as_bytes());
    format!("batch_{}", hex::encode(hasher.finalize()))
}

struct ProviderAttempt {
    result: Result<TransferReceipt, ProviderError>,
    calls: u32,
    class: Option<ErrorClass>,
}

/// Payout orchestrator - moves money for outstanding obligations
///
/// SECURITY: the only component that calls the provider. Every batch is sent
/// with one idempotency key across all retries.
pub struct PayoutOrchestrator {
    ledger: SettlementLedger,
    provider: Arc<dyn PaymentProvider>,
    alerts: Arc<dyn AlertSink>,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
    currency: String,
    lanes: PayeeLanes,
}

impl PayoutOrchestrator {
    pub fn new(
        ledger: SettlementLedger,
        provider: Arc<dyn PaymentProvider>,
        alerts: Arc<dyn AlertSink>,
        classifier: ErrorClassifier,
        retry: RetryPolicy,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            provider,
            alerts,
            classifier,
            retry,
            currency: currency.into(),
            lanes: PayeeLanes::new(),
        }
    }

    pub fn lanes(&self) -> &PayeeLanes {
        &self.lanes
    }

    /// Settle every outstanding obligation of one payee in a single transfer
    #[instrument(skip(self), fields(payee_id = %payee_id))]
    pub async fn settle(&self, payee_id: &str) -> AppResult<SettlementOutcome> {
        let _lane = self.lanes.acquire(payee_id).await;

        let outstanding = self.ledger.outstanding_for(payee_id).await?;
        let total: Decimal = outstanding.iter().map(|o| o.amount_owed).sum();
        if outstanding.is_empty() || total <= Decimal::ZERO {
            debug!("✓ Nothing outstanding for {}", payee_id);
            return Err(AppError::NothingToPay(payee_id.to_string()));
        }

        let destination = self
            .ledger
            .store()
            .payee_account(payee_id)
            .await?
            .ok_or_else(|| AppError::PayeeAccountMissing(payee_id.to_string()))?;

        info!(
            "📊 Found {} outstanding obligations for {} totalling {}",
            outstanding.len(),
            payee_id,
            total
        );

        let claimed = self.claim(&outstanding).await?;
        if claimed.is_empty() {
            return Err(AppError::NothingToPay(payee_id.to_string()));
        }

        let ids: Vec<Uuid> = claimed.iter().map(|o| o.id).collect();
        let amount: Decimal = claimed.iter().map(|o| o.amount_owed).sum();
        let batch_key = batch_key_for(&claimed);

        if let Err(e) = self.ledger.assign_batch(&ids, &batch_key).await {
            self.abandon(&ids).await;
            return Err(e);
        }

        let request = TransferRequest {
            destination_account_id: destination,
            amount,
            currency: self.currency.clone(),
            idempotency_key: batch_key.clone(),
        };

        info!(
            "🔄 Issuing transfer of {} {} to {} for {} obligations ({})",
            amount,
            self.currency,
            payee_id,
            ids.len(),
            batch_key
        );

        let attempt = self.send_with_retry(&request).await;
        match attempt.result {
            Ok(receipt) => self.record_success(payee_id, receipt, batch_key, amount, ids, attempt.calls).await,
            Err(provider_error) => {
                let reason = match attempt.class {
                    Some(ErrorClass::Retryable) => format!(
                        "retries exhausted after {} calls: {}",
                        attempt.calls, provider_error
                    ),
                    _ => provider_error.to_string(),
                };
                self.record_failure(payee_id, batch_key, amount, ids, reason, attempt.calls)
                    .await
            }
        }
    }

    /// Pending → InFlight for each obligation; losers of a race are dropped
    async fn claim(&self, outstanding: &[SettlementObligation]) -> AppResult<Vec<SettlementObligation>> {
        let mut claimed = Vec::with_capacity(outstanding.len());

        for obligation in outstanding {
            match self.ledger.begin_attempt(obligation.id).await {
                Ok(o) => claimed.push(o),
                Err(AppError::Ledger(LedgerError::AlreadyInFlight(id)))
                | Err(AppError::Ledger(LedgerError::InvalidTransition { id, .. })) => {
                    debug!("⏭️ Obligation {} claimed elsewhere, skipping", id);
                }
                Err(e) => {
                    let ids: Vec<Uuid> = claimed.iter().map(|o| o.id).collect();
                    self.abandon(&ids).await;
                    return Err(e);
                }
            }
        }

        Ok(claimed)
    }

    /// Fail a batch that never reached the provider
    async fn abandon(&self, ids: &[Uuid]) {
        for id in ids {
            if let Err(e) = self.ledger.mark_failed(*id, ABANDONED_REASON).await {
                error!("❌ Failed to abandon obligation {}: {:?}", id, e);
            }
        }
    }

    async fn send_with_retry(&self, request: &TransferRequest) -> ProviderAttempt {
        let mut calls = 0;

        loop {
            calls += 1;
            let result = match tokio::time::timeout(
                self.retry.call_timeout,
                self.provider.create_transfer(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(self.retry.call_timeout)),
            };

            let error = match result {
                Ok(receipt) => {
                    return ProviderAttempt {
                        result: Ok(receipt),
                        calls,
                        class: None,
                    }
                }
                Err(error) => error,
            };

            let class = self.classifier.classify(&error);
            if class == ErrorClass::Terminal || calls >= self.retry.max_attempts {
                return ProviderAttempt {
                    result: Err(error),
                    calls,
                    class: Some(class),
                };
            }

            let delay = self.retry.backoff_for(calls);
            warn!(
                "⚠️ Transfer call {} for {} failed ({}), retrying in {:?}",
                calls, request.idempotency_key, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn record_success(
        &self,
        payee_id: &str,
        receipt: TransferReceipt,
        batch_key: String,
        amount: Decimal,
        ids: Vec<Uuid>,
        provider_calls: u32,
    ) -> AppResult<SettlementOutcome> {
        let paid_at = Utc::now();
        let mut unrecorded = Vec::new();

        for id in &ids {
            if let Err(e) = self.ledger.mark_paid(*id, &receipt.transfer_id, paid_at).await {
                error!(
                    "❌ Transfer {} succeeded but obligation {} could not be marked paid: {:?}",
                    receipt.transfer_id, id, e
                );
                unrecorded.push(*id);
            }
        }

        if !unrecorded.is_empty() {
            self.alerts
                .raise(
                    Alert::new(
                        AlertKind::PayoutUnrecorded,
                        format!(
                            "Transfer {} succeeded but {} obligations were not marked paid",
                            receipt.transfer_id,
                            unrecorded.len()
                        ),
                    )
                    .payee(payee_id)
                    .obligations(unrecorded.iter().copied())
                    .details(json!({
                        "transfer_id": receipt.transfer_id,
                        "batch_key": batch_key,
                    })),
                )
                .await;

            return Ok(SettlementOutcome::Unrecorded {
                payee_id: payee_id.to_string(),
                transfer_id: receipt.transfer_id,
                batch_key,
                obligation_ids: ids,
            });
        }

        info!(
            "✅ Settled {} to {} with transfer {}",
            amount, payee_id, receipt.transfer_id
        );
        Ok(SettlementOutcome::Paid {
            payee_id: payee_id.to_string(),
            transfer_id: receipt.transfer_id,
            batch_key,
            amount,
            obligation_ids: ids,
            provider_calls,
        })
    }

    async fn record_failure(
        &self,
        payee_id: &str,
        batch_key: String,
        amount: Decimal,
        ids: Vec<Uuid>,
        reason: String,
        provider_calls: u32,
    ) -> AppResult<SettlementOutcome> {
        for id in &ids {
            if let Err(e) = self.ledger.mark_failed(*id, &reason).await {
                // A webhook may have settled it while we were retrying
                warn!("⚠️ Could not mark obligation {} failed: {:?}", id, e);
            }
        }

        self.alerts
            .raise(
                Alert::new(
                    AlertKind::PayoutFailed,
                    format!("Payout of {} to {} failed: {}", amount, payee_id, reason),
                )
                .payee(payee_id)
                .obligations(ids.iter().copied())
                .details(json!({
                    "batch_key": batch_key,
                    "amount": amount.to_string(),
                    "provider_calls": provider_calls,
                })),
            )
            .await;

        Ok(SettlementOutcome::Failed {
            payee_id: payee_id.to_string(),
            batch_key,
            amount,
            obligation_ids: ids,
            reason,
            provider_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::ObligationStatus;
    use crate::ledger::InMemoryLedgerStore;
    use crate::testing::{contractor_record, fast_retry, seed_record, FakeProvider, RecordingAlertSink};
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: SettlementLedger,
        provider: Arc<FakeProvider>,
        alerts: Arc<RecordingAlertSink>,
        orchestrator: Arc<PayoutOrchestrator>,
    }

    fn harness(provider: FakeProvider, max_attempts: u32) -> Harness {
        let ledger = SettlementLedger::new(Arc::new(InMemoryLedgerStore::new()));
        let provider = Arc::new(provider);
        let alerts = Arc::new(RecordingAlertSink::new());
        let orchestrator = Arc::new(PayoutOrchestrator::new(
            ledger.clone(),
            provider.clone(),
            alerts.clone(),
            ErrorClassifier::default(),
            fast_retry(max_attempts),
            "usd",
        ));
        Harness {
            ledger,
            provider,
            alerts,
            orchestrator,
        }
    }

    /// Three contractor obligations for c-1 worth $40 + $30 + $30
    async fn seed_hundred_dollars(ledger: &SettlementLedger) -> Vec<Uuid> {
        ledger
            .store()
            .upsert_payee_account("c-1", "acct_c1")
            .await
            .unwrap();

        let mut ids = Vec::new();
        for (booking, rate) in [("b-1", dec!(40)), ("b-2", dec!(30)), ("b-3", dec!(30))] {
            let record = contractor_record(booking, "c-1", 60, dec!(50), rate);
            ids.extend(seed_record(ledger, &record).await.iter().map(|o| o.id));
        }
        ids
    }

    #[tokio::test]
    async fn test_batch_key_depends_on_ids_and_attempt() {
        let ledger = SettlementLedger::new(Arc::new(InMemoryLedgerStore::new()));
        let a = seed_record(&ledger, &contractor_record("b-1", "c-1", 60, dec!(50), dec!(40))).await[0].clone();
        let b = seed_record(&ledger, &contractor_record("b-2", "c-1", 60, dec!(50), dec!(40))).await[0].clone();

        let key = batch_key_for(&[a.clone(), b.clone()]);
        assert_eq!(key, batch_key_for(&[b.clone(), a.clone()]));
        assert_ne!(key, batch_key_for(&[a.clone()]));
        assert!(key.starts_with("batch_"));

        let mut retried = a.clone();
        retried.attempt_count += 1;
        assert_ne!(key, batch_key_for(&[retried, b]));
    }

    #[tokio::test]
    async fn test_settle_pays_whole_batch_with_one_transfer() {
        let h = harness(FakeProvider::new(), 5);
        let ids = seed_hundred_dollars(&h.ledger).await;

        let outcome = h.orchestrator.settle("c-1").await.unwrap();
        let transfer_id = match &outcome {
            SettlementOutcome::Paid {
                transfer_id,
                amount,
                obligation_ids,
                ..
            } => {
                assert_eq!(*amount, dec!(100));
                assert_eq!(obligation_ids.len(), 3);
                transfer_id.clone()
            }
            other => panic!("unexpected outcome {:?}", other),
        };

        for id in ids {
            let o = h.ledger.get_obligation(id).await.unwrap();
            assert_eq!(o.status, ObligationStatus::Paid);
            assert_eq!(o.external_transfer_id.as_deref(), Some(transfer_id.as_str()));
        }
        assert!(h.ledger.outstanding_for("c-1").await.unwrap().is_empty());

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].destination_account_id, "acct_c1");
        assert_eq!(requests[0].amount, dec!(100));
        assert!(h.alerts.alerts().is_empty());

        let err = h.orchestrator.settle("c-1").await.unwrap_err();
        assert!(matches!(err, AppError::NothingToPay(_)));
    }

    #[tokio::test]
    async fn test_terminal_error_fails_batch_until_reset() {
        let provider = FakeProvider::new();
        provider.push_error("account_invalid", "destination account closed");
        let h = harness(provider, 5);
        let ids = seed_hundred_dollars(&h.ledger).await;

        let outcome = h.orchestrator.settle("c-1").await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Failed { provider_calls: 1, .. }));

        let failed = h.ledger.get_obligation(ids[0]).await.unwrap();
        assert_eq!(failed.status, ObligationStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("account_invalid"));
        assert!(h.ledger.outstanding_for("c-1").await.unwrap().is_empty());

        let alerts = h.alerts.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::PayoutFailed);

        h.ledger
            .reset_to_pending(ids[0], "ops-1", "payee re-onboarded")
            .await
            .unwrap();
        let outcome = h.orchestrator.settle("c-1").await.unwrap();
        match outcome {
            SettlementOutcome::Paid { amount, .. } => assert_eq!(amount, dec!(40)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_batch_is_sent_under_a_new_key() {
        let provider = FakeProvider::new();
        provider.push_error("account_invalid", "destination account closed");
        let h = harness(provider, 5);
        let ids = seed_hundred_dollars(&h.ledger).await;

        let first = h.orchestrator.settle("c-1").await.unwrap();
        assert!(matches!(first, SettlementOutcome::Failed { .. }));

        // payee fixes their account, operator resets every obligation
        h.ledger
            .store()
            .upsert_payee_account("c-1", "acct_c1_new")
            .await
            .unwrap();
        for id in &ids {
            h.ledger
                .reset_to_pending(*id, "ops-1", "account replaced")
                .await
                .unwrap();
        }

        let second = h.orchestrator.settle("c-1").await.unwrap();
        match &second {
            SettlementOutcome::Paid { amount, .. } => assert_eq!(*amount, dec!(100)),
            other => panic!("unexpected outcome {:?}", other),
        }

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].idempotency_key, requests[1].idempotency_key);
        assert_eq!(requests[1].destination_account_id, "acct_c1_new");
    }

    #[tokio::test]
    async fn test_retryable_errors_reuse_idempotency_key() {
        let provider = FakeProvider::new();
        provider.push_error("rate_limit", "slow down");
        provider.push_error("api_connection_error", "reset by peer");
        let h = harness(provider, 5);
        seed_hundred_dollars(&h.ledger).await;

        let outcome = h.orchestrator.settle("c-1").await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Paid { provider_calls: 3, .. }));

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests
            .iter()
            .all(|r| r.idempotency_key == requests[0].idempotency_key));
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let provider = FakeProvider::new();
        for _ in 0..3 {
            provider.push_error("server_error", "upstream unavailable");
        }
        let h = harness(provider, 3);
        let ids = seed_hundred_dollars(&h.ledger).await;

        let outcome = h.orchestrator.settle("c-1").await.unwrap();
        match outcome {
            SettlementOutcome::Failed {
                reason,
                provider_calls,
                ..
            } => {
                assert_eq!(provider_calls, 3);
                assert!(reason.contains("retries exhausted"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            h.ledger.get_obligation(ids[2]).await.unwrap().status,
            ObligationStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_call_timeout_is_retryable() {
        let provider = FakeProvider::new();
        provider.stall_next_call();
        let h = harness(provider, 5);
        seed_hundred_dollars(&h.ledger).await;

        let outcome = h.orchestrator.settle("c-1").await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Paid { provider_calls: 2, .. }));
    }

    #[tokio::test]
    async fn test_nothing_to_pay_and_missing_account() {
        let h = harness(FakeProvider::new(), 5);

        let err = h.orchestrator.settle("nobody").await.unwrap_err();
        assert!(matches!(err, AppError::NothingToPay(_)));

        let record = contractor_record("b-9", "c-2", 60, dec!(50), dec!(30));
        let obligations = seed_record(&h.ledger, &record).await;
        let err = h.orchestrator.settle("c-2").await.unwrap_err();
        assert!(matches!(err, AppError::PayeeAccountMissing(_)));

        // no state change before the account check
        let o = h.ledger.get_obligation(obligations[0].id).await.unwrap();
        assert_eq!(o.status, ObligationStatus::Pending);
        assert_eq!(o.attempt_count, 0);
        assert!(h.provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_settles_issue_one_transfer() {
        let h = harness(FakeProvider::new(), 5);
        seed_hundred_dollars(&h.ledger).await;

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.settle("c-1").await })
        };
        let second = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.settle("c-1").await })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let paid = results
            .iter()
            .filter(|r| matches!(r, Ok(o) if o.is_paid()))
            .count();
        let nothing = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::NothingToPay(_))))
            .count();

        assert_eq!(paid, 1);
        assert_eq!(nothing, 1);
        assert_eq!(h.provider.requests().len(), 1);
    }
}
