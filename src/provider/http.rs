use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{PaymentProvider, ProviderError, TransferReceipt, TransferRequest};
use crate::config::ProviderConfig;
use crate::error::{AppError, AppResult};

/// REST client for the payout provider's transfer API
pub struct HttpPaymentProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateTransferBody<'a> {
    destination: &'a str,
    /// Minor units (cents)
    amount: i64,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateTransferResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

impl HttpPaymentProvider {
    pub fn new(config: &ProviderConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build provider client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }
}

/// Convert a 2dp amount to integer cents
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    let cents = amount.checked_mul(Decimal::ONE_HUNDRED)?;
    if cents.fract() != Decimal::ZERO {
        return None;
    }
    cents.to_i64()
}

fn error_from_response(status: StatusCode, body: &str) -> ProviderError {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        let code = envelope
            .error
            .code
            .or(envelope.error.kind)
            .unwrap_or_else(|| fallback_code(status).to_string());
        return ProviderError::new(code, envelope.error.message.unwrap_or_default());
    }
    ProviderError::new(fallback_code(status), format!("HTTP {}: {}", status, body))
}

fn fallback_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::TOO_MANY_REQUESTS => "rate_limit",
        StatusCode::CONFLICT => "idempotency_error",
        s if s.is_server_error() => "server_error",
        _ => "invalid_request",
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, ProviderError> {
        let amount = to_minor_units(request.amount).ok_or_else(|| {
            ProviderError::new(
                "invalid_request",
                format!("amount {} is not a whole number of cents", request.amount),
            )
        })?;

        let body = CreateTransferBody {
            destination: &request.destination_account_id,
            amount,
            currency: &request.currency,
        };

        debug!(
            "Creating transfer of {} {} to {} ({})",
            request.amount, request.currency, request.destination_account_id, request.idempotency_key
        );

        let response = self
            .client
            .post(format!("{}/v1/transfers", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::new("timeout", e.to_string())
                } else {
                    ProviderError::new("api_connection_error", e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, &error_text));
        }

        let result: CreateTransferResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new("server_error", format!("Malformed provider response: {}", e)))?;

        info!("💸 Transfer created: {}", result.id);
        Ok(TransferReceipt {
            transfer_id: result.id,
        })
    }
}
