pub mod classify;
pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use classify::{ErrorClass, ErrorClassifier};
pub use http::HttpPaymentProvider;

/// One transfer to a payee's connected account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRequest {
    pub destination_account_id: String,
    pub amount: Decimal,
    pub currency: String,
    /// Same key for every retry of the same batch
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

/// Error reported by the payment provider, identified by its error code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new("timeout", format!("no response after {:?}", after))
    }
}

/// Outbound payment provider
///
/// INVARIANTS:
/// - Two calls with the same idempotency key create at most one transfer
/// - Errors carry the provider's code so they can be classified
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ProviderError>;
}
