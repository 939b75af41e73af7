use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::WebhookConfig;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Payout-Signature";

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Full header value for a payload, as the provider would send it
pub fn signature_header(secret: &str, timestamp: i64, body: &[u8]) -> AppResult<String> {
    Ok(format!("t={},v1={}", timestamp, sign(secret, timestamp, body)?))
}

/// Verifies `Payout-Signature: t=<unix>,v1=<hex>` before anything reads the body
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.secret.clone(), Duration::seconds(config.tolerance_secs))
    }

    pub fn verify(&self, header: Option<&str>, body: &[u8], now: DateTime<Utc>) -> AppResult<()> {
        if self.secret.is_empty() {
            return Err(AppError::InvalidSignature(
                "webhook secret is not configured".to_string(),
            ));
        }

        let header = header.ok_or_else(|| {
            AppError::InvalidSignature(format!("missing {} header", SIGNATURE_HEADER))
        })?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| AppError::InvalidSignature("missing or malformed timestamp".to_string()))?;
        if candidates.is_empty() {
            return Err(AppError::InvalidSignature("no v1 signature".to_string()));
        }

        let signed_at = DateTime::<Utc>::from_timestamp(timestamp, 0)
            .ok_or_else(|| AppError::InvalidSignature("timestamp out of range".to_string()))?;
        let age = now - signed_at;
        if age > self.tolerance || age < -self.tolerance {
            return Err(AppError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AppError::Internal(format!("Invalid webhook secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);

        // constant-time comparison per candidate
        let matched = candidates.iter().any(|candidate| match hex::decode(candidate) {
            Ok(bytes) => mac.clone().verify_slice(&bytes).is_ok(),
            Err(_) => false,
        });

        if matched {
            Ok(())
        } else {
            Err(AppError::InvalidSignature("signature mismatch".to_string()))
        }
    }
}
