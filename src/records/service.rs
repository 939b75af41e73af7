use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult, LedgerError};
use crate::ledger::models::*;
use crate::ledger::{SettlementLedger, SYSTEM_ACTOR};
use crate::split::calculate_split;

/// Largest rate the ledger stores (NUMERIC(12,2))
pub const MAX_RATE: Decimal = dec!(9999999999.99);

/// A finalized shift as submitted by the booking system
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewWorkRecord {
    #[validate(length(min = 1, max = 128))]
    pub booking_id: String,
    /// Distinguishes shifts within one booking
    #[validate(length(min = 1, max = 128))]
    pub shift_key: String,
    #[validate(length(min = 1, max = 128))]
    pub client_id: String,
    #[validate(length(min = 1, max = 128))]
    pub contractor_id: String,
    #[validate(length(min = 1, max = 128))]
    pub marketing_partner_id: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub training_center_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub client_hourly_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub contractor_hourly_rate: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub marketing_commission_rate: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub training_commission_rate: Decimal,
}

impl NewWorkRecord {
    pub fn finalize_key(&self) -> String {
        format!("{}:{}", self.booking_id, self.shift_key)
    }

    pub fn payees(&self) -> PayeeRefs {
        PayeeRefs {
            contractor_id: self.contractor_id.clone(),
            marketing_partner_id: self.marketing_partner_id.clone(),
            training_center_id: self.training_center_id.clone(),
        }
    }

    /// Commission rates only apply when the partner is attached
    pub fn effective_rates(&self) -> RateSnapshot {
        RateSnapshot {
            client_hourly_rate: self.client_hourly_rate,
            contractor_hourly_rate: self.contractor_hourly_rate,
            marketing_commission_rate: if self.marketing_partner_id.is_some() {
                self.marketing_commission_rate
            } else {
                Decimal::ZERO
            },
            training_commission_rate: if self.training_center_id.is_some() {
                self.training_commission_rate
            } else {
                Decimal::ZERO
            },
        }
    }

    pub fn minutes_worked(&self) -> AppResult<i64> {
        if self.ended_at < self.started_at {
            return Err(AppError::InvalidInput(format!(
                "shift ends ({}) before it starts ({})",
                self.ended_at, self.started_at
            )));
        }
        Ok((self.ended_at - self.started_at).num_minutes())
    }

    fn check(&self) -> AppResult<()> {
        self.validate()
            .map_err(|e| AppError::InvalidInput(format!("Validation failed: {}", e)))?;

        let rates = [
            ("client_hourly_rate", self.client_hourly_rate),
            ("contractor_hourly_rate", self.contractor_hourly_rate),
            ("marketing_commission_rate", self.marketing_commission_rate),
            ("training_commission_rate", self.training_commission_rate),
        ];
        for (name, rate) in rates {
            if rate > MAX_RATE {
                return Err(AppError::InvalidInput(format!(
                    "{} must not exceed {}, got {}",
                    name, MAX_RATE, rate
                )));
            }
        }
        Ok(())
    }

    /// Build the immutable record, running the split
    fn into_record(self, finalize_key: String, supersedes: Option<Uuid>) -> AppResult<WorkRecord> {
        let minutes_worked = self.minutes_worked()?;
        let mut record = WorkRecord {
            id: Uuid::new_v4(),
            finalize_key,
            payees: self.payees(),
            rates: self.effective_rates(),
            booking_id: self.booking_id,
            client_id: self.client_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            minutes_worked,
            breakdown: Default::default(),
            supersedes,
            created_at: Utc::now(),
        };
        record.breakdown = calculate_split(&record.split_input())?;
        Ok(record)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizedRecord {
    pub record: WorkRecord,
    pub obligations: Vec<SettlementObligation>,
    /// false when the finalize key was already known
    pub created: bool,
}

/// Everything known about one work record
#[derive(Debug, Clone, Serialize)]
pub struct WorkRecordView {
    pub record: WorkRecord,
    pub obligations: Vec<SettlementObligation>,
    pub reversals: Vec<Reversal>,
    pub distribution: DistributionSummary,
    pub superseded_by: Option<Uuid>,
}

/// Turns finalized shifts into work records and their obligations
#[derive(Clone)]
pub struct WorkRecordService {
    ledger: SettlementLedger,
}

impl WorkRecordService {
    pub fn new(ledger: SettlementLedger) -> Self {
        Self { ledger }
    }

    /// Idempotent on booking id + shift key. A repeat returns the stored
    /// record and creates any obligations a previous attempt did not.
    pub async fn finalize(&self, new: NewWorkRecord) -> AppResult<FinalizedRecord> {
        new.check()?;
        let finalize_key = new.finalize_key();
        let store = self.ledger.store();

        if let Some(existing) = store.find_work_record_by_key(&finalize_key).await? {
            return self.replay(existing, &new).await;
        }

        let record = new.clone().into_record(finalize_key.clone(), None)?;
        match store.insert_work_record(&record).await {
            Ok(()) => {}
            Err(AppError::Ledger(LedgerError::DuplicateWorkRecord(_))) => {
                // concurrent finalize of the same shift won the insert
                let existing = store
                    .find_work_record_by_key(&finalize_key)
                    .await?
                    .ok_or_else(|| AppError::Internal(format!("Work record {} vanished", finalize_key)))?;
                return self.replay(existing, &new).await;
            }
            Err(e) => return Err(e),
        }

        info!(
            "📝 Work record {} finalized for {}: {} minutes, charge {}",
            record.id, finalize_key, record.minutes_worked, record.breakdown.client_charge
        );
        self.audit(
            AuditEntry::new(
                AuditEventType::WorkRecordFinalized,
                SYSTEM_ACTOR,
                json!({ "finalize_key": finalize_key, "breakdown": record.breakdown }),
            )
            .for_work_record(record.id),
        )
        .await;

        let obligations = self
            .ledger
            .create_obligations(record.id, &record.breakdown, &record.payees)
            .await?;

        Ok(FinalizedRecord {
            record,
            obligations,
            created: true,
        })
    }

    async fn replay(&self, existing: WorkRecord, new: &NewWorkRecord) -> AppResult<FinalizedRecord> {
        let same_shift = existing.minutes_worked == new.minutes_worked()?
            && existing.rates == new.effective_rates()
            && existing.payees == new.payees();
        if !same_shift {
            return Err(AppError::StateConflict(format!(
                "Finalize key {} was already used for a different shift; submit a correction instead",
                existing.finalize_key
            )));
        }

        let obligations = self
            .ledger
            .create_obligations(existing.id, &existing.breakdown, &existing.payees)
            .await?;

        Ok(FinalizedRecord {
            record: existing,
            obligations,
            created: false,
        })
    }

    /// Replace a record with a corrected one.
    ///
    /// Refused once any obligation of the original is in flight or paid. The
    /// original's remaining obligations are voided before the correction is written.
    pub async fn supersede(
        &self,
        original_id: Uuid,
        correction: NewWorkRecord,
        operator_id: &str,
        reason: &str,
    ) -> AppResult<FinalizedRecord> {
        if operator_id.trim().is_empty() || reason.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "operator_id and reason are required".to_string(),
            ));
        }
        correction.check()?;

        let store = self.ledger.store();
        let original = store
            .get_work_record(original_id)
            .await?
            .ok_or(LedgerError::WorkRecordNotFound(original_id))?;

        if let Some(existing) = store.find_superseding(original_id).await? {
            return Err(AppError::StateConflict(format!(
                "Work record {} was already superseded by {}",
                original_id, existing.id
            )));
        }

        let obligations = store.obligations_for_record(original_id).await?;
        if let Some(settled) = obligations
            .iter()
            .find(|o| matches!(o.status, ObligationStatus::InFlight | ObligationStatus::Paid))
        {
            return Err(AppError::StateConflict(format!(
                "Obligation {} of work record {} is {}; corrections are only possible before payment",
                settled.id, original_id, settled.status
            )));
        }

        // fail on bad input before anything is voided
        let record = correction.into_record(format!("{}:correction", original.finalize_key), Some(original_id))?;

        for obligation in &obligations {
            if let Err(e) = self
                .ledger
                .void_for_correction(obligation.id, operator_id, reason)
                .await
            {
                warn!(
                    "⚠️ Correction of {} stopped, obligation {} could not be voided: {:?}",
                    original_id, obligation.id, e
                );
                return Err(AppError::StateConflict(format!(
                    "Obligation {} changed while the correction was applied: {}",
                    obligation.id, e
                )));
            }
        }

        store.insert_work_record(&record).await?;

        info!(
            operator = operator_id,
            "🔁 Work record {} superseded by {}", original_id, record.id
        );
        self.audit(
            AuditEntry::new(
                AuditEventType::WorkRecordSuperseded,
                operator_id,
                json!({
                    "original_id": original_id,
                    "correction_id": record.id,
                    "reason": reason,
                    "original_breakdown": original.breakdown,
                    "corrected_breakdown": record.breakdown,
                }),
            )
            .for_work_record(original_id),
        )
        .await;

        let obligations = self
            .ledger
            .create_obligations(record.id, &record.breakdown, &record.payees)
            .await?;

        Ok(FinalizedRecord {
            record,
            obligations,
            created: true,
        })
    }

    pub async fn get(&self, id: Uuid) -> AppResult<WorkRecordView> {
        let store = self.ledger.store();
        let record = store
            .get_work_record(id)
            .await?
            .ok_or(LedgerError::WorkRecordNotFound(id))?;
        let obligations = store.obligations_for_record(id).await?;
        let reversals = store.reversals_for_record(id).await?;
        let superseded_by = store.find_superseding(id).await?.map(|r| r.id);
        let distribution = DistributionSummary::build(&record, &obligations, &reversals);

        Ok(WorkRecordView {
            record,
            obligations,
            reversals,
            distribution,
            superseded_by,
        })
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.ledger.store().append_audit(&entry).await {
            warn!("⚠️ Failed to write audit entry: {:?}", e);
        }
    }
}
