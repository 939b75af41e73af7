use std::collections::HashSet;

use super::ProviderError;
use crate::config::ClassificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Safe to retry with the same idempotency key
    Retryable,
    Terminal,
}

/// Maps provider error codes to retry behavior using the configured table
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retryable: HashSet<String>,
    terminal: HashSet<String>,
    unknown: ErrorClass,
}

impl ErrorClassifier {
    pub fn new(config: &ClassificationConfig) -> Self {
        Self {
            retryable: config.retryable_codes.iter().cloned().collect(),
            terminal: config.terminal_codes.iter().cloned().collect(),
            unknown: if config.retry_unknown {
                ErrorClass::Retryable
            } else {
                ErrorClass::Terminal
            },
        }
    }

    pub fn classify(&self, error: &ProviderError) -> ErrorClass {
        // terminal wins if a code is listed twice
        if self.terminal.contains(&error.code) {
            ErrorClass::Terminal
        } else if self.retryable.contains(&error.code) {
            ErrorClass::Retryable
        } else {
            self.unknown
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&ClassificationConfig::default())
    }
}
