use serde::Deserialize;
use std::time::Duration;

use crate::payout::RetryPolicy;

/// Engine configuration.
///
/// Layered: built-in defaults, then an optional `settlement.toml`, then
/// `SETTLEMENT__*` environment variables (`SETTLEMENT__RETRY__MAX_ATTEMPTS=7`).
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// When unset the engine runs on the in-memory ledger store
    pub database_url: Option<String>,
    pub bind_address: String,
    /// Single settlement currency, ISO 4217 lowercase
    pub currency: String,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    pub classification: ClassificationConfig,
    pub webhook: WebhookConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_address: "0.0.0.0:8080".to_string(),
            currency: "usd".to_string(),
            provider: ProviderConfig::default(),
            retry: RetryConfig::default(),
            classification: ClassificationConfig::default(),
            webhook: WebhookConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Upper bound for a single transfer call
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Total provider calls per batch, including the first
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// Provider error code → retryable / terminal mapping
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClassificationConfig {
    pub retryable_codes: Vec<String>,
    pub terminal_codes: Vec<String>,
    /// How to treat codes that appear in neither list
    pub retry_unknown: bool,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            retryable_codes: [
                "rate_limit",
                "api_connection_error",
                "timeout",
                "server_error",
                "lock_timeout",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            terminal_codes: [
                "account_invalid",
                "insufficient_funds",
                "compliance_block",
                "idempotency_error",
                "invalid_request",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            retry_unknown: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared secret for `Payout-Signature`; an empty secret rejects every delivery
    pub secret: String,
    pub tolerance_secs: i64,
    pub dedup_window_hours: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            tolerance_secs: 300,
            dedup_window_hours: 72,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    Daily,
    Interval,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub mode: ScheduleMode,
    /// UTC hour for daily runs
    pub daily_hour_utc: u32,
    pub interval_secs: u64,
    pub max_parallel_payees: usize,
    pub in_flight_timeout_secs: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: ScheduleMode::Daily,
            daily_hour_utc: 2,
            interval_secs: 3_600,
            max_parallel_payees: 8,
            in_flight_timeout_secs: 600,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("settlement")
    }

    /// Load using `file` (without extension) as the optional file source
    pub fn load_from(file: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("SETTLEMENT")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("classification.retryable_codes")
                    .with_list_parse_key("classification.terminal_codes"),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;

        // Plain DATABASE_URL is what sqlx tooling and most deploys set
        if config.database_url.is_none() {
            config.database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(config::ConfigError::Message(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.scheduler.max_parallel_payees == 0 {
            return Err(config::ConfigError::Message(
                "scheduler.max_parallel_payees must be at least 1".to_string(),
            ));
        }
        if self.scheduler.daily_hour_utc > 23 {
            return Err(config::ConfigError::Message(
                "scheduler.daily_hour_utc must be between 0 and 23".to_string(),
            ));
        }
        let worst_settle = RetryPolicy::from_config(&self.retry, &self.provider).worst_case();
        if self.scheduler.in_flight_timeout_secs <= 0
            || (self.scheduler.in_flight_timeout_secs as u64) <= worst_settle.as_secs()
        {
            return Err(config::ConfigError::Message(format!(
                "scheduler.in_flight_timeout_secs must exceed the longest settle ({}s)",
                worst_settle.as_secs()
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(config::ConfigError::Message("currency is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.initial_backoff_ms, 1_000);
        assert_eq!(config.retry.max_backoff_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.provider.timeout(), Duration::from_secs(30));
        assert_eq!(config.webhook.dedup_window_hours, 72);
        assert_eq!(config.scheduler.in_flight_timeout_secs, 600);
        assert!(config.classification.retryable_codes.contains(&"rate_limit".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_overrides() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        env::set_var("SETTLEMENT__RETRY__MAX_ATTEMPTS", "7");
        env::set_var("SETTLEMENT__SCHEDULER__MODE", "interval");
        env::set_var("SETTLEMENT__CLASSIFICATION__TERMINAL_CODES", "card_declined,account_closed");

        let config = Config::load_from("does-not-exist").expect("config loads");

        env::remove_var("SETTLEMENT__RETRY__MAX_ATTEMPTS");
        env::remove_var("SETTLEMENT__SCHEDULER__MODE");
        env::remove_var("SETTLEMENT__CLASSIFICATION__TERMINAL_CODES");

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.scheduler.mode, ScheduleMode::Interval);
        assert_eq!(
            config.classification.terminal_codes,
            vec!["card_declined".to_string(), "account_closed".to_string()]
        );
        // untouched sections keep their defaults
        assert_eq!(config.webhook.tolerance_secs, 300);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_in_flight_bound_shorter_than_settle() {
        let mut config = Config::default();
        // 5 calls x 30s + 4 backoffs x 30s = 270s
        config.scheduler.in_flight_timeout_secs = 270;
        assert!(config.validate().is_err());

        config.scheduler.in_flight_timeout_secs = 271;
        assert!(config.validate().is_ok());
    }
}
