//! Shared error type for the annuaire services
//!
//! Errors carry a retryability classification so callers can feed them
//! straight into [`crate::retry::retry_with_backoff`] without re-inspecting
//! message strings.

use thiserror::Error;

/// Error type shared by the annuaire crates
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("timeout after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },
}

impl CoreError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Whether a retry can reasonably be expected to succeed.
    ///
    /// Configuration and validation problems are deterministic and never
    /// retried; transport-level failures are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::ServiceUnavailable { .. } | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        let err = CoreError::Network {
            message: "connection reset".into(),
            source: None,
        };
        assert!(err.is_retryable());

        let err = CoreError::Timeout {
            operation: "page fetch".into(),
            seconds: 30,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn deterministic_errors_are_not_retryable() {
        assert!(!CoreError::configuration("missing ANNUAIRE_DATABASE_URL").is_retryable());
        assert!(!CoreError::validation("postal code must be 5 digits").is_retryable());
    }
}
