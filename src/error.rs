use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::ObligationStatus;
use crate::split::SplitBreakdown;

/// Top-level error type for the entire engine
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Split error: {0}")]
    Split(#[from] SplitError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Nothing to pay for payee {0}")]
    NothingToPay(String),

    #[error("Payee {0} has no connected account")]
    PayeeAccountMissing(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Split calculator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplitError {
    #[error("Invalid split input: {0}")]
    InvalidInput(String),

    /// Pricing misconfiguration upstream: the payee shares exceed the client charge.
    #[error("Agency retained amount is negative ({})", breakdown.agency_retained)]
    NegativeRetainedAmount { breakdown: SplitBreakdown },
}

/// Settlement ledger errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Obligation not found: {0}")]
    ObligationNotFound(Uuid),

    #[error("Work record not found: {0}")]
    WorkRecordNotFound(Uuid),

    #[error("Obligations already exist for work record {0}")]
    DuplicateObligation(Uuid),

    #[error("Work record already exists for finalize key {0}")]
    DuplicateWorkRecord(String),

    #[error("Obligation {0} is already in flight")]
    AlreadyInFlight(Uuid),

    #[error("Invalid transition for obligation {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: ObligationStatus,
        to: ObligationStatus,
    },

    #[error("Obligation {id} already paid with transfer {existing}, refusing {attempted}")]
    TransferMismatch {
        id: Uuid,
        existing: String,
        attempted: String,
    },

    #[error("Invalid amount for obligation: {0}")]
    InvalidAmount(Decimal),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::InvalidInput(msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg, None)
            }
            AppError::Split(SplitError::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, "INVALID_SPLIT_INPUT", msg, None)
            }
            AppError::Split(SplitError::NegativeRetainedAmount { breakdown }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NEGATIVE_RETAINED_AMOUNT",
                "Payee shares exceed the client charge".to_string(),
                serde_json::to_value(&breakdown).ok(),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            AppError::Ledger(LedgerError::ObligationNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "OBLIGATION_NOT_FOUND",
                format!("Obligation not found: {}", id),
                None,
            ),
            AppError::Ledger(LedgerError::WorkRecordNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "WORK_RECORD_NOT_FOUND",
                format!("Work record not found: {}", id),
                None,
            ),
            AppError::Ledger(LedgerError::AlreadyInFlight(id)) => (
                StatusCode::CONFLICT,
                "ALREADY_IN_FLIGHT",
                format!("Obligation {} is already in flight", id),
                None,
            ),
            AppError::Ledger(LedgerError::InvalidTransition { id, from, to }) => (
                StatusCode::CONFLICT,
                "INVALID_TRANSITION",
                format!("Obligation {} cannot move from {:?} to {:?}", id, from, to),
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            AppError::Ledger(err @ LedgerError::TransferMismatch { .. })
            | AppError::Ledger(err @ LedgerError::DuplicateObligation(_))
            | AppError::Ledger(err @ LedgerError::DuplicateWorkRecord(_)) => {
                (StatusCode::CONFLICT, "LEDGER_CONFLICT", err.to_string(), None)
            }
            AppError::Ledger(LedgerError::InvalidAmount(amount)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                format!("Invalid amount: {}", amount),
                None,
            ),
            AppError::StateConflict(msg) => (StatusCode::CONFLICT, "STATE_CONFLICT", msg, None),
            AppError::NothingToPay(payee) => (
                StatusCode::CONFLICT,
                "NOTHING_TO_PAY",
                format!("No outstanding obligations for payee {}", payee),
                None,
            ),
            AppError::PayeeAccountMissing(payee) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "PAYEE_ACCOUNT_MISSING",
                format!("Payee {} has no connected account", payee),
                None,
            ),
            AppError::InvalidSignature(msg) => {
                (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", msg, None)
            }
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("Malformed JSON: {}", error))
    }
}

/// Result type alias for the engine
pub type AppResult<T> = Result<T, AppError>;
