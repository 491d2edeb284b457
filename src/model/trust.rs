use serde::{Deserialize, Serialize};

/// Pinned host key for one target identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub identity: String,
    pub fingerprint: String,
}

impl TrustRecord {
    pub fn new(identity: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{} {}", self.identity, self.fingerprint)
    }

    /// Parses one `identity fingerprint` line. Comments and blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let mut parts = trimmed.split_whitespace();
        let identity = parts.next()?;
        let fingerprint = parts.next()?;
        Some(Self::new(identity, fingerprint))
    }
}
