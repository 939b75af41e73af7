use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::*;
use crate::error::AppResult;

/// Persistence seam for the settlement ledger.
///
/// Implementations own atomicity; the state machine rules live in `SettlementLedger`.
///
/// INVARIANTS every implementation must uphold:
/// - `insert_obligations` is all-or-nothing and fails with `LedgerError::DuplicateObligation`
///   when the work record already has obligations
/// - `transition` is a compare-and-swap on the status column: it only applies when the
///   stored status equals `from`, and returns `None` otherwise
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== WORK RECORDS ==========

    /// Insert a work record. Fails with `LedgerError::DuplicateWorkRecord` if the
    /// finalize key is taken, and with `StateConflict` if `supersedes` was already superseded.
    async fn insert_work_record(&self, record: &WorkRecord) -> AppResult<()>;

    async fn get_work_record(&self, id: Uuid) -> AppResult<Option<WorkRecord>>;

    async fn find_work_record_by_key(&self, finalize_key: &str) -> AppResult<Option<WorkRecord>>;

    /// The record that superseded `id`, if any
    async fn find_superseding(&self, id: Uuid) -> AppResult<Option<WorkRecord>>;

    // ========== OBLIGATIONS ==========

    async fn insert_obligations(
        &self,
        work_record_id: Uuid,
        obligations: &[SettlementObligation],
    ) -> AppResult<()>;

    async fn get_obligation(&self, id: Uuid) -> AppResult<Option<SettlementObligation>>;

    async fn obligations_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<SettlementObligation>>;

    async fn find_by_transfer_id(&self, transfer_id: &str) -> AppResult<Vec<SettlementObligation>>;

    async fn find_by_batch_key(&self, batch_key: &str) -> AppResult<Vec<SettlementObligation>>;

    async fn list_obligations(&self, filter: &ObligationFilter) -> AppResult<Vec<SettlementObligation>>;

    async fn in_flight_started_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<SettlementObligation>>;

    async fn payees_with_outstanding(&self) -> AppResult<Vec<String>>;

    /// Compare-and-swap status transition
    async fn transition(
        &self,
        id: Uuid,
        from: ObligationStatus,
        to: ObligationStatus,
        change: &StatusChange,
    ) -> AppResult<Option<SettlementObligation>>;

    // ========== REVERSALS ==========

    /// Insert a reversal; returns false when one already exists for (obligation, event)
    async fn insert_reversal(&self, reversal: &Reversal) -> AppResult<bool>;

    async fn reversals_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<Reversal>>;

    // ========== AUDIT LOG ==========

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()>;

    async fn audit_for_obligation(&self, obligation_id: Uuid) -> AppResult<Vec<AuditEntry>>;

    // ========== PAYEE ACCOUNTS ==========

    async fn upsert_payee_account(&self, payee_id: &str, connected_account_id: &str) -> AppResult<()>;

    async fn payee_account(&self, payee_id: &str) -> AppResult<Option<String>>;

    // ========== WEBHOOK DEDUP ==========

    /// Claim an event id for processing. Returns false when the id was already
    /// claimed after `window_start`.
    async fn claim_event(&self, event_id: &str, now: DateTime<Utc>, window_start: DateTime<Utc>) -> AppResult<bool>;

    /// Release a claim so a redelivery can be processed again
    async fn release_event(&self, event_id: &str) -> AppResult<()>;

    /// Drop claims older than `before`; returns how many were removed
    async fn purge_events(&self, before: DateTime<Utc>) -> AppResult<u64>;
}
