//! Shared fixtures for unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::alerts::{Alert, AlertSink};
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::{InMemoryLedgerStore, LedgerStore, SettlementLedger};
use crate::payout::RetryPolicy;
use crate::provider::{
    ErrorClass, ErrorClassifier, PaymentProvider, ProviderError, TransferReceipt, TransferRequest,
};
use crate::split::calculate_split;

fn build_record(booking_id: &str, payees: PayeeRefs, minutes: i64, rates: RateSnapshot) -> WorkRecord {
    let started_at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let mut record = WorkRecord {
        id: Uuid::new_v4(),
        finalize_key: format!("{}:shift-1", booking_id),
        booking_id: booking_id.to_string(),
        client_id: "client-1".to_string(),
        payees,
        started_at,
        ended_at: started_at + ChronoDuration::minutes(minutes),
        minutes_worked: minutes,
        rates,
        breakdown: Default::default(),
        supersedes: None,
        created_at: Utc::now(),
    };
    record.breakdown = calculate_split(&record.split_input()).unwrap();
    record
}

/// 465 minutes at $40 / $28 / $1 / $0.50 with all three payees attached
pub fn reference_record(booking_id: &str) -> WorkRecord {
    build_record(
        booking_id,
        PayeeRefs {
            contractor_id: "c-1".to_string(),
            marketing_partner_id: Some("m-1".to_string()),
            training_center_id: Some("t-1".to_string()),
        },
        465,
        RateSnapshot {
            client_hourly_rate: dec!(40),
            contractor_hourly_rate: dec!(28),
            marketing_commission_rate: dec!(1),
            training_commission_rate: dec!(0.50),
        },
    )
}

/// Shift with only a contractor attached
pub fn contractor_record(
    booking_id: &str,
    contractor_id: &str,
    minutes: i64,
    client_rate: Decimal,
    contractor_rate: Decimal,
) -> WorkRecord {
    build_record(
        booking_id,
        PayeeRefs {
            contractor_id: contractor_id.to_string(),
            marketing_partner_id: None,
            training_center_id: None,
        },
        minutes,
        RateSnapshot {
            client_hourly_rate: client_rate,
            contractor_hourly_rate: contractor_rate,
            marketing_commission_rate: Decimal::ZERO,
            training_commission_rate: Decimal::ZERO,
        },
    )
}

pub async fn insert_record(ledger: &SettlementLedger, record: &WorkRecord) {
    ledger.store().insert_work_record(record).await.unwrap();
}

/// Insert the record and create its obligations
pub async fn seed_record(ledger: &SettlementLedger, record: &WorkRecord) -> Vec<SettlementObligation> {
    insert_record(ledger, record).await;
    ledger
        .create_obligations(record.id, &record.breakdown, &record.payees)
        .await
        .unwrap()
}

/// Millisecond backoff so retry tests stay fast
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        max_attempts,
        call_timeout: Duration::from_millis(200),
    }
}

#[derive(Default)]
struct FakeProviderState {
    scripted: VecDeque<Result<(), ProviderError>>,
    delay_next: Option<Duration>,
    requests: Vec<TransferRequest>,
    outcomes: HashMap<String, Result<String, ProviderError>>,
    transfers: usize,
}

/// Provider double. Honors idempotency keys the way a real provider does:
/// a key that completed replays its stored result, success or terminal error.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeProviderState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call fails with this code
    pub fn push_error(&self, code: &str, message: &str) {
        self.state
            .lock()
            .scripted
            .push_back(Err(ProviderError::new(code, message)));
    }

    /// The next call never answers
    pub fn stall_next_call(&self) {
        self.delay_next_call(Duration::from_secs(30));
    }

    /// The next call answers only after `delay`
    pub fn delay_next_call(&self, delay: Duration) {
        self.state.lock().delay_next = Some(delay);
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            state.delay_next.take()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(stored) = state.outcomes.get(&request.idempotency_key) {
            return stored
                .clone()
                .map(|transfer_id| TransferReceipt { transfer_id });
        }

        if let Some(Err(error)) = state.scripted.pop_front() {
            if ErrorClassifier::default().classify(&error) == ErrorClass::Terminal {
                state
                    .outcomes
                    .insert(request.idempotency_key.clone(), Err(error.clone()));
            }
            return Err(error);
        }

        state.transfers += 1;
        let transfer_id = format!("tr_{}", state.transfers);
        state
            .outcomes
            .insert(request.idempotency_key.clone(), Ok(transfer_id.clone()));
        Ok(TransferReceipt { transfer_id })
    }
}

/// Alert sink that keeps everything it is given
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn raise(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

/// In-memory store whose obligation lookups can be switched to fail like a lost database
pub struct FlakyStore {
    inner: InMemoryLedgerStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: InMemoryLedgerStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn fail_lookups(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn insert_work_record(&self, record: &WorkRecord) -> AppResult<()> {
        self.inner.insert_work_record(record).await
    }

    async fn get_work_record(&self, id: Uuid) -> AppResult<Option<WorkRecord>> {
        self.inner.get_work_record(id).await
    }

    async fn find_work_record_by_key(&self, finalize_key: &str) -> AppResult<Option<WorkRecord>> {
        self.inner.find_work_record_by_key(finalize_key).await
    }

    async fn find_superseding(&self, id: Uuid) -> AppResult<Option<WorkRecord>> {
        self.inner.find_superseding(id).await
    }

    async fn insert_obligations(&self, work_record_id: Uuid, obligations: &[SettlementObligation]) -> AppResult<()> {
        self.inner.insert_obligations(work_record_id, obligations).await
    }

    async fn get_obligation(&self, id: Uuid) -> AppResult<Option<SettlementObligation>> {
        self.inner.get_obligation(id).await
    }

    async fn obligations_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<SettlementObligation>> {
        self.inner.obligations_for_record(work_record_id).await
    }

    async fn find_by_transfer_id(&self, transfer_id: &str) -> AppResult<Vec<SettlementObligation>> {
        self.check()?;
        self.inner.find_by_transfer_id(transfer_id).await
    }

    async fn find_by_batch_key(&self, batch_key: &str) -> AppResult<Vec<SettlementObligation>> {
        self.check()?;
        self.inner.find_by_batch_key(batch_key).await
    }

    async fn list_obligations(&self, filter: &ObligationFilter) -> AppResult<Vec<SettlementObligation>> {
        self.inner.list_obligations(filter).await
    }

    async fn in_flight_started_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<SettlementObligation>> {
        self.inner.in_flight_started_before(cutoff).await
    }

    async fn payees_with_outstanding(&self) -> AppResult<Vec<String>> {
        self.inner.payees_with_outstanding().await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ObligationStatus,
        to: ObligationStatus,
        change: &StatusChange,
    ) -> AppResult<Option<SettlementObligation>> {
        self.inner.transition(id, from, to, change).await
    }

    async fn insert_reversal(&self, reversal: &Reversal) -> AppResult<bool> {
        self.inner.insert_reversal(reversal).await
    }

    async fn reversals_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<Reversal>> {
        self.inner.reversals_for_record(work_record_id).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        self.inner.append_audit(entry).await
    }

    async fn audit_for_obligation(&self, obligation_id: Uuid) -> AppResult<Vec<AuditEntry>> {
        self.inner.audit_for_obligation(obligation_id).await
    }

    async fn upsert_payee_account(&self, payee_id: &str, connected_account_id: &str) -> AppResult<()> {
        self.inner.upsert_payee_account(payee_id, connected_account_id).await
    }

    async fn payee_account(&self, payee_id: &str) -> AppResult<Option<String>> {
        self.inner.payee_account(payee_id).await
    }

    async fn claim_event(&self, event_id: &str, now: DateTime<Utc>, window_start: DateTime<Utc>) -> AppResult<bool> {
        self.inner.claim_event(event_id, now, window_start).await
    }

    async fn release_event(&self, event_id: &str) -> AppResult<()> {
        self.inner.release_event(event_id).await
    }

    async fn purge_events(&self, before: DateTime<Utc>) -> AppResult<u64> {
        self.inner.purge_events(before).await
    }
}
