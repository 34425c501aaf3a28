//! Error taxonomy observable to callers.
//!
//! Retryable vs. poison is a property of the error kind, not the call site:
//! the ingestion pipeline backs off on retryable kinds and dead-letters the
//! rest. Suppression is deliberately *not* an error — a suppressed decision
//! is an ordinary `TimingDecision` with `suppressed == true`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TimingError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Resolver gave up before creating a new Universal ID. Only produced
    /// when synthesis is disabled by configuration.
    #[error("identity could not be resolved and synthesis is disabled")]
    IdentityUnresolved,

    #[error("engagement curve unavailable: {0}")]
    CurveUnavailable(String),

    /// Surfaced as a warning on decisions, never as a request failure.
    #[error("predictor unavailable: {0}")]
    PredictorUnavailable(String),

    #[error("send window expired: {0}")]
    WindowExpired(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl TimingError {
    /// Stable machine-readable code for API responses and DLQ payloads.
    pub fn code(&self) -> &'static str {
        match self {
            TimingError::InvalidInput(_) => "invalid_input",
            TimingError::IdentityUnresolved => "identity_unresolved",
            TimingError::CurveUnavailable(_) => "curve_unavailable",
            TimingError::PredictorUnavailable(_) => "predictor_unavailable",
            TimingError::WindowExpired(_) => "window_expired",
            TimingError::Timeout(_) => "timeout",
            TimingError::BackendUnavailable(_) => "backend_unavailable",
        }
    }

    /// Transient infrastructure failures worth retrying with backoff.
    /// Everything else is poison and goes to the dead-letter sink on first
    /// occurrence.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TimingError::Timeout(_) | TimingError::BackendUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TimingError>;

/// Structured error body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
}

impl From<&TimingError> for ErrorReport {
    fn from(err: &TimingError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}
