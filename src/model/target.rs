use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A compute node resolved by the target directory. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub public_address: String,
    #[serde(default)]
    pub private_address: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Target {
    pub fn new(name: impl Into<String>, public_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            public_address: public_address.into(),
            private_address: String::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_private_address(mut self, address: impl Into<String>) -> Self {
        self.private_address = address.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// The address to dial, or `None` when the selected one is blank.
    pub fn address(&self, use_private: bool) -> Option<&str> {
        let raw = if use_private {
            self.private_address.trim()
        } else {
            self.public_address.trim()
        };
        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    }

    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or("")
    }
}
