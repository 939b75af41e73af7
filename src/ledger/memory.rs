use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::LedgerStore;
use crate::error::{AppError, AppResult, LedgerError};

#[derive(Default)]
struct MemoryState {
    work_records: HashMap<Uuid, WorkRecord>,
    obligations: HashMap<Uuid, SettlementObligation>,
    reversals: Vec<Reversal>,
    audit_log: Vec<AuditEntry>,
    payee_accounts: HashMap<String, String>,
    processed_events: HashMap<String, DateTime<Utc>>,
}

/// In-memory ledger store.
///
/// Used when no database is configured and by tests. Every operation takes the
/// single state lock, which makes each status transition linearizable.
pub struct InMemoryLedgerStore {
    state: RwLock<MemoryState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut obligations: Vec<SettlementObligation>) -> Vec<SettlementObligation> {
    obligations.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.payee_role.cmp(&b.payee_role))
            .then_with(|| a.id.cmp(&b.id))
    });
    obligations
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_work_record(&self, record: &WorkRecord) -> AppResult<()> {
        let mut state = self.state.write().await;

        if state
            .work_records
            .values()
            .any(|r| r.finalize_key == record.finalize_key)
        {
            return Err(LedgerError::DuplicateWorkRecord(record.finalize_key.clone()).into());
        }

        if let Some(original) = record.supersedes {
            if state
                .work_records
                .values()
                .any(|r| r.supersedes == Some(original))
            {
                return Err(AppError::StateConflict(format!(
                    "Work record {} was already superseded",
                    original
                )));
            }
        }

        state.work_records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_work_record(&self, id: Uuid) -> AppResult<Option<WorkRecord>> {
        let state = self.state.read().await;
        Ok(state.work_records.get(&id).cloned())
    }

    async fn find_work_record_by_key(&self, finalize_key: &str) -> AppResult<Option<WorkRecord>> {
        let state = self.state.read().await;
        Ok(state
            .work_records
            .values()
            .find(|r| r.finalize_key == finalize_key)
            .cloned())
    }

    async fn find_superseding(&self, id: Uuid) -> AppResult<Option<WorkRecord>> {
        let state = self.state.read().await;
        Ok(state
            .work_records
            .values()
            .find(|r| r.supersedes == Some(id))
            .cloned())
    }

    async fn insert_obligations(
        &self,
        work_record_id: Uuid,
        obligations: &[SettlementObligation],
    ) -> AppResult<()> {
        let mut state = self.state.write().await;

        if !state.work_records.contains_key(&work_record_id) {
            return Err(LedgerError::WorkRecordNotFound(work_record_id).into());
        }

        if state
            .obligations
            .values()
            .any(|o| o.work_record_id == work_record_id)
        {
            return Err(LedgerError::DuplicateObligation(work_record_id).into());
        }

        for obligation in obligations {
            state.obligations.insert(obligation.id, obligation.clone());
        }
        Ok(())
    }

    async fn get_obligation(&self, id: Uuid) -> AppResult<Option<SettlementObligation>> {
        let state = self.state.read().await;
        Ok(state.obligations.get(&id).cloned())
    }

    async fn obligations_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<SettlementObligation>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .obligations
                .values()
                .filter(|o| o.work_record_id == work_record_id)
                .cloned()
                .collect(),
        ))
    }

    async fn find_by_transfer_id(&self, transfer_id: &str) -> AppResult<Vec<SettlementObligation>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .obligations
                .values()
                .filter(|o| o.external_transfer_id.as_deref() == Some(transfer_id))
                .cloned()
                .collect(),
        ))
    }

    async fn find_by_batch_key(&self, batch_key: &str) -> AppResult<Vec<SettlementObligation>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .obligations
                .values()
                .filter(|o| o.batch_key.as_deref() == Some(batch_key))
                .cloned()
                .collect(),
        ))
    }

    async fn list_obligations(&self, filter: &ObligationFilter) -> AppResult<Vec<SettlementObligation>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .obligations
                .values()
                .filter(|o| filter.matches(o))
                .cloned()
                .collect(),
        ))
    }

    async fn in_flight_started_before(&self, cutoff: DateTime<Utc>) -> AppResult<Vec<SettlementObligation>> {
        let state = self.state.read().await;
        Ok(sorted(
            state
                .obligations
                .values()
                .filter(|o| {
                    o.status == ObligationStatus::InFlight
                        && o.attempt_started_at.map_or(true, |t| t < cutoff)
                })
                .cloned()
                .collect(),
        ))
    }

    async fn payees_with_outstanding(&self) -> AppResult<Vec<String>> {
        let state = self.state.read().await;
        let payees: BTreeSet<String> = state
            .obligations
            .values()
            .filter(|o| o.status == ObligationStatus::Pending)
            .map(|o| o.payee_id.clone())
            .collect();
        Ok(payees.into_iter().collect())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ObligationStatus,
        to: ObligationStatus,
        change: &StatusChange,
    ) -> AppResult<Option<SettlementObligation>> {
        let mut state = self.state.write().await;

        let obligation = state
            .obligations
            .get_mut(&id)
            .ok_or(LedgerError::ObligationNotFound(id))?;

        if obligation.status != from {
            return Ok(None);
        }

        change.apply(obligation, to, Utc::now());
        Ok(Some(obligation.clone()))
    }

    async fn insert_reversal(&self, reversal: &Reversal) -> AppResult<bool> {
        let mut state = self.state.write().await;

        if state
            .reversals
            .iter()
            .any(|r| r.obligation_id == reversal.obligation_id && r.event_id == reversal.event_id)
        {
            return Ok(false);
        }

        state.reversals.push(reversal.clone());
        Ok(true)
    }

    async fn reversals_for_record(&self, work_record_id: Uuid) -> AppResult<Vec<Reversal>> {
        let state = self.state.read().await;
        Ok(state
            .reversals
            .iter()
            .filter(|r| r.work_record_id == work_record_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.audit_log.push(entry.clone());
        Ok(())
    }

    async fn audit_for_obligation(&self, obligation_id: Uuid) -> AppResult<Vec<AuditEntry>> {
        let state = self.state.read().await;
        Ok(state
            .audit_log
            .iter()
            .filter(|e| e.obligation_id == Some(obligation_id))
            .cloned()
            .collect())
    }

    async fn upsert_payee_account(&self, payee_id: &str, connected_account_id: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        state
            .payee_accounts
            .insert(payee_id.to_string(), connected_account_id.to_string());
        Ok(())
    }

    async fn payee_account(&self, payee_id: &str) -> AppResult<Option<String>> {
        let state = self.state.read().await;
        Ok(state.payee_accounts.get(payee_id).cloned())
    }

    async fn claim_event(&self, event_id: &str, now: DateTime<Utc>, window_start: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write().await;

        match state.processed_events.get(event_id) {
            Some(claimed_at) if *claimed_at >= window_start => Ok(false),
            _ => {
                state.processed_events.insert(event_id.to_string(), now);
                Ok(true)
            }
        }
    }

    async fn release_event(&self, event_id: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.processed_events.remove(event_id);
        Ok(())
    }

    async fn purge_events(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let mut state = self.state.write().await;
        let count = state.processed_events.len();
        state.processed_events.retain(|_, claimed_at| *claimed_at >= before);
        Ok((count - state.processed_events.len()) as u64)
    }
}
