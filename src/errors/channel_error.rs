use super::FleetError;
use std::time::Duration;
use thiserror::Error;

/// Every way building or using a secure channel can fail. A channel that
/// returns one of these is never handed out half-open.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("authentication as {user} failed: {reason}")]
    Auth { user: String, reason: String },

    #[error("host key for {identity} changed (pinned {expected}, presented {observed})")]
    TrustViolation {
        identity: String,
        expected: String,
        observed: String,
    },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("{operation} aborted")]
    Aborted { operation: String },
}

impl ChannelError {
    pub fn transport(message: impl Into<String>) -> Self {
        ChannelError::Transport(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        ChannelError::Protocol(message.into())
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        ChannelError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn aborted(operation: impl Into<String>) -> Self {
        ChannelError::Aborted {
            operation: operation.into(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ChannelError::Auth { .. })
    }
}

impl From<ChannelError> for FleetError {
    fn from(err: ChannelError) -> Self {
        match &err {
            ChannelError::TrustViolation { .. } => FleetError::trust_violation(err.to_string())
                .with_hint(
                    "Verify the host was rebuilt legitimately, then remove its line from known_hosts.",
                ),
            ChannelError::Timeout { .. } => {
                let mut out = FleetError::channel(err.to_string());
                out.retryable = true;
                out
            }
            _ => FleetError::channel(err.to_string()),
        }
    }
}
