use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;
use crate::split::{SplitBreakdown, SplitInput};

/// Role of a payee on a shift. The platform itself is never a payee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayeeRole {
    Contractor,
    Marketing,
    Training,
}

impl PayeeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayeeRole::Contractor => "contractor",
            PayeeRole::Marketing => "marketing",
            PayeeRole::Training => "training",
        }
    }

    pub fn all() -> [PayeeRole; 3] {
        [PayeeRole::Contractor, PayeeRole::Marketing, PayeeRole::Training]
    }
}

impl fmt::Display for PayeeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PayeeRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contractor" => Ok(PayeeRole::Contractor),
            "marketing" => Ok(PayeeRole::Marketing),
            "training" => Ok(PayeeRole::Training),
            other => Err(AppError::InvalidInput(format!("Unknown payee role: {}", other))),
        }
    }
}

/// Obligation status state machine
///
/// Valid transitions:
/// - Pending → InFlight (begin attempt), Voided (record superseded)
/// - InFlight → Paid, Failed
/// - Failed → Pending (operator reset), Voided (record superseded)
/// - Paid, Voided → NO TRANSITIONS ALLOWED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    InFlight,
    Paid,
    Failed,
    Voided,
}

impl ObligationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObligationStatus::Pending => "pending",
            ObligationStatus::InFlight => "in_flight",
            ObligationStatus::Paid => "paid",
            ObligationStatus::Failed => "failed",
            ObligationStatus::Voided => "voided",
        }
    }

    pub fn can_transition_to(&self, to: ObligationStatus) -> bool {
        matches!(
            (self, to),
            (ObligationStatus::Pending, ObligationStatus::InFlight)
                | (ObligationStatus::Pending, ObligationStatus::Voided)
                | (ObligationStatus::InFlight, ObligationStatus::Paid)
                | (ObligationStatus::InFlight, ObligationStatus::Failed)
                | (ObligationStatus::Failed, ObligationStatus::Pending)
                | (ObligationStatus::Failed, ObligationStatus::Voided)
        )
    }
}

impl fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObligationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ObligationStatus::Pending),
            "in_flight" => Ok(ObligationStatus::InFlight),
            "paid" => Ok(ObligationStatus::Paid),
            "failed" => Ok(ObligationStatus::Failed),
            "voided" => Ok(ObligationStatus::Voided),
            other => Err(AppError::InvalidInput(format!("Unknown obligation status: {}", other))),
        }
    }
}

/// Hourly rates captured when the shift was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSnapshot {
    #[serde(with = "rust_decimal::serde::str")]
    pub client_hourly_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub contractor_hourly_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub marketing_commission_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub training_commission_rate: Decimal,
}

/// Who gets paid for a shift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayeeRefs {
    pub contractor_id: String,
    pub marketing_partner_id: Option<String>,
    pub training_center_id: Option<String>,
}

impl PayeeRefs {
    pub fn payee_for(&self, role: PayeeRole) -> Option<&str> {
        match role {
            PayeeRole::Contractor => Some(self.contractor_id.as_str()),
            PayeeRole::Marketing => self.marketing_partner_id.as_deref(),
            PayeeRole::Training => self.training_center_id.as_deref(),
        }
    }
}

/// WorkRecord entity - one completed, billable shift
///
/// INVARIANT: immutable once written. Corrections are new records linked through `supersedes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub id: Uuid,
    /// booking id + shift key, unique per physical shift
    pub finalize_key: String,
    pub booking_id: String,
    pub client_id: String,
    pub payees: PayeeRefs,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub minutes_worked: i64,
    pub rates: RateSnapshot,
    pub breakdown: SplitBreakdown,
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl WorkRecord {
    pub fn split_input(&self) -> SplitInput {
        SplitInput {
            minutes_worked: self.minutes_worked,
            client_hourly_rate: self.rates.client_hourly_rate,
            contractor_hourly_rate: self.rates.contractor_hourly_rate,
            marketing_commission_rate: self.rates.marketing_commission_rate,
            training_commission_rate: self.rates.training_commission_rate,
        }
    }
}

/// Deterministic idempotency key for one (work record, role) pair
pub fn obligation_idempotency_key(work_record_id: Uuid, role: PayeeRole) -> String {
    format!("obl_{}_{}", work_record_id.simple(), role.as_str())
}

/// Obligation to be inserted by the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct NewObligation {
    pub work_record_id: Uuid,
    pub payee_role: PayeeRole,
    pub payee_id: String,
    pub amount_owed: Decimal,
}

/// SettlementObligation entity - what one payee is owed for one shift
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementObligation {
    pub id: Uuid,
    pub work_record_id: Uuid,
    pub payee_role: PayeeRole,
    pub payee_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_owed: Decimal,
    pub status: ObligationStatus,
    pub idempotency_key: String,
    /// Provider idempotency key of the batch this obligation was last sent in
    pub batch_key: Option<String>,
    pub external_transfer_id: Option<String>,
    pub attempt_count: i32,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementObligation {
    pub fn from_new(new: NewObligation, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: obligation_idempotency_key(new.work_record_id, new.payee_role),
            work_record_id: new.work_record_id,
            payee_role: new.payee_role,
            payee_id: new.payee_id,
            amount_owed: new.amount_owed,
            status: ObligationStatus::Pending,
            batch_key: None,
            external_transfer_id: None,
            attempt_count: 0,
            attempt_started_at: None,
            paid_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field changes applied together with a status compare-and-swap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusChange {
    pub batch_key: Option<Option<String>>,
    pub external_transfer_id: Option<Option<String>>,
    pub paid_at: Option<Option<DateTime<Utc>>>,
    pub failure_reason: Option<Option<String>>,
    pub attempt_started_at: Option<Option<DateTime<Utc>>>,
    pub increment_attempts: bool,
}

impl StatusChange {
    /// Apply the change to an in-memory copy of the obligation
    pub fn apply(&self, obligation: &mut SettlementObligation, to: ObligationStatus, now: DateTime<Utc>) {
        obligation.status = to;
        obligation.updated_at = now;
        if let Some(v) = &self.batch_key {
            obligation.batch_key = v.clone();
        }
        if let Some(v) = &self.external_transfer_id {
            obligation.external_transfer_id = v.clone();
        }
        if let Some(v) = self.paid_at {
            obligation.paid_at = v;
        }
        if let Some(v) = &self.failure_reason {
            obligation.failure_reason = v.clone();
        }
        if let Some(v) = self.attempt_started_at {
            obligation.attempt_started_at = v;
        }
        if self.increment_attempts {
            obligation.attempt_count += 1;
        }
    }
}

/// Compensating record for money reported as distributed and later reversed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reversal {
    pub id: Uuid,
    pub obligation_id: Uuid,
    pub work_record_id: Uuid,
    /// Always the negative of the reversed obligation's amount
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub transfer_id: String,
    pub event_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Audit event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    WorkRecordFinalized,
    WorkRecordSuperseded,
    ObligationsCreated,
    AttemptStarted,
    BatchAssigned,
    ObligationPaid,
    ObligationFailed,
    ObligationReset,
    ObligationVoided,
    ReversalRecorded,
    ReconciliationAlert,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::WorkRecordFinalized => "work_record_finalized",
            AuditEventType::WorkRecordSuperseded => "work_record_superseded",
            AuditEventType::ObligationsCreated => "obligations_created",
            AuditEventType::AttemptStarted => "attempt_started",
            AuditEventType::BatchAssigned => "batch_assigned",
            AuditEventType::ObligationPaid => "obligation_paid",
            AuditEventType::ObligationFailed => "obligation_failed",
            AuditEventType::ObligationReset => "obligation_reset",
            AuditEventType::ObligationVoided => "obligation_voided",
            AuditEventType::ReversalRecorded => "reversal_recorded",
            AuditEventType::ReconciliationAlert => "reconciliation_alert",
        }
    }
}

impl FromStr for AuditEventType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let event = match s {
            "work_record_finalized" => AuditEventType::WorkRecordFinalized,
            "work_record_superseded" => AuditEventType::WorkRecordSuperseded,
            "obligations_created" => AuditEventType::ObligationsCreated,
            "attempt_started" => AuditEventType::AttemptStarted,
            "batch_assigned" => AuditEventType::BatchAssigned,
            "obligation_paid" => AuditEventType::ObligationPaid,
            "obligation_failed" => AuditEventType::ObligationFailed,
            "obligation_reset" => AuditEventType::ObligationReset,
            "obligation_voided" => AuditEventType::ObligationVoided,
            "reversal_recorded" => AuditEventType::ReversalRecorded,
            "reconciliation_alert" => AuditEventType::ReconciliationAlert,
            other => {
                return Err(AppError::InvalidInput(format!("Unknown audit event: {}", other)))
            }
        };
        Ok(event)
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub work_record_id: Option<Uuid>,
    pub obligation_id: Option<Uuid>,
    pub actor: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, actor: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            work_record_id: None,
            obligation_id: None,
            actor: actor.into(),
            details,
            created_at: Utc::now(),
        }
    }

    pub fn for_obligation(mut self, obligation: &SettlementObligation) -> Self {
        self.obligation_id = Some(obligation.id);
        self.work_record_id = Some(obligation.work_record_id);
        self
    }

    pub fn for_work_record(mut self, work_record_id: Uuid) -> Self {
        self.work_record_id = Some(work_record_id);
        self
    }
}

/// Operator query filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ObligationFilter {
    pub payee_id: Option<String>,
    pub status: Option<ObligationStatus>,
    pub payee_role: Option<PayeeRole>,
    pub work_record_id: Option<Uuid>,
}

impl ObligationFilter {
    pub fn matches(&self, obligation: &SettlementObligation) -> bool {
        self.payee_id.as_deref().map_or(true, |p| p == obligation.payee_id)
            && self.status.map_or(true, |s| s == obligation.status)
            && self.payee_role.map_or(true, |r| r == obligation.payee_role)
            && self.work_record_id.map_or(true, |w| w == obligation.work_record_id)
    }
}

/// Where every cent of one shift's client charge currently sits
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSummary {
    pub work_record_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub client_charge: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub agency_retained: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub paid: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub reversed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub in_flight: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub pending: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub failed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub voided: Decimal,
}

impl DistributionSummary {
    pub fn build(record: &WorkRecord, obligations: &[SettlementObligation], reversals: &[Reversal]) -> Self {
        let sum = |status: ObligationStatus| -> Decimal {
            obligations
                .iter()
                .filter(|o| o.status == status)
                .map(|o| o.amount_owed)
                .sum()
        };

        Self {
            work_record_id: record.id,
            client_charge: record.breakdown.client_charge,
            agency_retained: record.breakdown.agency_retained,
            paid: sum(ObligationStatus::Paid),
            reversed: reversals.iter().map(|r| r.amount).sum(),
            in_flight: sum(ObligationStatus::InFlight),
            pending: sum(ObligationStatus::Pending),
            failed: sum(ObligationStatus::Failed),
            voided: sum(ObligationStatus::Voided),
        }
    }

    /// Net money that actually reached payees
    pub fn distributed(&self) -> Decimal {
        self.paid + self.reversed
    }

    /// Money the shift still owes its payees (or that is in question)
    pub fn gap(&self) -> Decimal {
        self.client_charge - self.agency_retained - self.distributed()
    }

    /// Every obligation bucket plus the retained share accounts for the client charge
    pub fn is_balanced(&self) -> bool {
        self.paid + self.in_flight + self.pending + self.failed + self.voided + self.agency_retained
            == self.client_charge
    }
}
