//! Error types shared by all resilience primitives.
//!
//! Decorators never wrap the caller's error. An operation returning
//! `Result<T, E>` gets back its own `E` untouched, and policy outcomes
//! (open circuit, full bulkhead, exhausted limiter) are converted into `E`
//! through `From<ResilienceError>`. Callers detect a rejection by matching
//! their own `#[from] ResilienceError` variant.

use thiserror::Error;

/// Outcome produced by a policy rather than by the wrapped operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ResilienceError {
    /// The circuit breaker is open and rejecting calls.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The half-open trial quota is exhausted.
    #[error("too many requests in half-open state")]
    TooManyRequests,

    /// No slot free and the bulkhead wait queue is full (or disabled).
    #[error("bulkhead is full")]
    BulkheadFull,

    /// Queued for a bulkhead slot longer than the configured wait.
    #[error("bulkhead wait timeout")]
    BulkheadTimeout,

    /// The rate limiter cannot admit the request within its limits.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The caller cancelled while waiting for a slot, token or retry delay.
    #[error("operation cancelled")]
    Cancelled,
}

impl ResilienceError {
    /// True for outcomes that mean "a policy said no".
    ///
    /// `Cancelled` is the caller's own decision and is not a rejection.
    pub const fn is_rejection(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Short label used in log fields and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::TooManyRequests => "too_many_requests",
            Self::BulkheadFull => "bulkhead_full",
            Self::BulkheadTimeout => "bulkhead_timeout",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Configuration validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// Settings file could not be read.
    #[error("Failed to read settings from {path}: {message}")]
    Io { path: String, message: String },

    /// Settings file is not valid TOML for [`crate::ResilienceSettings`].
    #[error("Failed to parse settings: {message}")]
    Parse { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result of validating or loading configuration.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    enum ServiceError {
        #[error("backend unavailable")]
        Backend,
        #[error(transparent)]
        Policy(#[from] ResilienceError),
    }

    #[test]
    fn cancelled_is_not_a_rejection() {
        for err in [
            ResilienceError::CircuitOpen,
            ResilienceError::TooManyRequests,
            ResilienceError::BulkheadFull,
            ResilienceError::BulkheadTimeout,
            ResilienceError::RateLimited,
        ] {
            assert!(err.is_rejection(), "{err} should be a rejection");
        }
        assert!(!ResilienceError::Cancelled.is_rejection());
    }

    #[test]
    fn policy_errors_convert_into_caller_error() {
        let err: ServiceError = ResilienceError::BulkheadFull.into();
        assert!(matches!(err, ServiceError::Policy(ResilienceError::BulkheadFull)));
        assert_eq!(err.to_string(), "bulkhead is full");
        assert!(!matches!(ServiceError::Backend, ServiceError::Policy(_)));
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::invalid("rate must be greater than 0");
        assert_eq!(err.to_string(), "Invalid configuration: rate must be greater than 0");
    }
}
