use serde::Serialize;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetErrorKind {
    InvalidParams,
    Directory,
    Reconciliation,
    ConcurrencyConflict,
    TrustViolation,
    Channel,
    Timeout,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetError {
    pub kind: FleetErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub retryable: bool,
}

impl FleetError {
    pub fn new(kind: FleetErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            retryable: matches!(
                kind,
                FleetErrorKind::Timeout | FleetErrorKind::ConcurrencyConflict
            ),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::InvalidParams, "INVALID_PARAMS", message)
    }

    pub fn directory(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::Directory, "DIRECTORY", message)
    }

    pub fn reconciliation(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::Reconciliation, "RECONCILIATION", message)
    }

    /// Stale fingerprint on a metadata write. A specialisation of a
    /// reconciliation failure that the caller may retry after re-fetching.
    pub fn concurrency_conflict(message: impl Into<String>) -> Self {
        Self::new(
            FleetErrorKind::ConcurrencyConflict,
            "CONCURRENCY_CONFLICT",
            message,
        )
    }

    pub fn trust_violation(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::TrustViolation, "TRUST_VIOLATION", message)
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::Channel, "CHANNEL", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::Cancelled, "CANCELLED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FleetErrorKind::Internal, "INTERNAL", message)
    }

    pub fn is_reconciliation(&self) -> bool {
        matches!(
            self.kind,
            FleetErrorKind::Reconciliation | FleetErrorKind::ConcurrencyConflict
        )
    }
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for FleetError {}

impl From<std::io::Error> for FleetError {
    fn from(err: std::io::Error) -> Self {
        FleetError::internal(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(FleetError::timeout("metadata lock").retryable);
        assert!(FleetError::concurrency_conflict("stale").retryable);
        assert!(!FleetError::cancelled("interrupted").retryable);
        assert!(!FleetError::reconciliation("bad blob").retryable);
    }

    #[test]
    fn display_is_the_message() {
        let err = FleetError::cancelled("interrupted before dispatch").with_hint("re-run");
        assert_eq!(err.to_string(), "interrupted before dispatch");
        assert_eq!(err.code, "CANCELLED");
    }
}
