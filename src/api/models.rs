use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::records::NewWorkRecord;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Correction of an already finalized work record
#[derive(Debug, Deserialize, Validate)]
pub struct CorrectionRequest {
    #[validate(length(min = 1, message = "operator_id is required"))]
    pub operator_id: String,
    #[validate(length(min = 1, message = "reason is required"))]
    pub reason: String,
    pub record: NewWorkRecord,
}

/// Operator reset of a failed obligation
#[derive(Debug, Deserialize, Validate)]
pub struct ResetRequest {
    #[validate(length(min = 1, message = "operator_id is required"))]
    pub operator_id: String,
    #[validate(length(min = 1, message = "justification is required"))]
    pub justification: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PayeeAccountRequest {
    #[validate(length(min = 1, max = 255, message = "connected_account_id is required"))]
    pub connected_account_id: String,
}

/// GET /obligations query string
#[derive(Debug, Default, Deserialize)]
pub struct ObligationQuery {
    pub payee_id: Option<String>,
    pub status: Option<ObligationStatus>,
    pub role: Option<PayeeRole>,
    pub work_record_id: Option<Uuid>,
}

impl From<ObligationQuery> for ObligationFilter {
    fn from(query: ObligationQuery) -> Self {
        ObligationFilter {
            payee_id: query.payee_id,
            status: query.status,
            payee_role: query.role,
            work_record_id: query.work_record_id,
        }
    }
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct ObligationListResponse {
    pub count: usize,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_owed: Decimal,
    pub obligations: Vec<SettlementObligation>,
}

impl From<Vec<SettlementObligation>> for ObligationListResponse {
    fn from(obligations: Vec<SettlementObligation>) -> Self {
        Self {
            count: obligations.len(),
            total_owed: obligations.iter().map(|o| o.amount_owed).sum(),
            obligations,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditTrailResponse {
    pub obligation_id: Uuid,
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Serialize)]
pub struct PayeeAccountResponse {
    pub payee_id: String,
    pub connected_account_id: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub timestamp: DateTime<Utc>,
}

/// Run `validator` rules and flatten field errors into one message
pub fn validate_request<T: Validate>(request: &T) -> AppResult<()> {
    request.validate().map_err(|e| {
        let errors = e
            .field_errors()
            .into_iter()
            .map(|(field, errors)| {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");

        AppError::InvalidInput(format!("Validation failed: {}", errors))
    })
}
