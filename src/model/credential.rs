use crate::constants::metadata as metadata_constants;
use crate::errors::FleetError;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// The reconciliation identity of a key entry. At most one entry per
/// identity may exist inside a metadata blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryIdentity {
    pub owner_user: String,
    pub algorithm: String,
    pub comment: String,
}

impl EntryIdentity {
    pub fn new(
        owner_user: impl Into<String>,
        algorithm: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            owner_user: owner_user.into(),
            algorithm: algorithm.into(),
            comment: comment.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub owner_user: String,
    pub algorithm: String,
    pub public_key_material: Vec<u8>,
    pub comment: String,
}

impl Credential {
    pub fn new(
        owner_user: impl Into<String>,
        algorithm: impl Into<String>,
        public_key_material: Vec<u8>,
        comment: impl Into<String>,
    ) -> Result<Self, FleetError> {
        let credential = Self {
            owner_user: owner_user.into(),
            algorithm: algorithm.into(),
            public_key_material,
            comment: comment.into(),
        };
        credential.validate()?;
        Ok(credential)
    }

    /// Builds a credential from base64 key text as it appears in an
    /// authorized_keys line.
    pub fn from_base64(
        owner_user: impl Into<String>,
        algorithm: impl Into<String>,
        key_base64: &str,
        comment: impl Into<String>,
    ) -> Result<Self, FleetError> {
        let material = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim().as_bytes())
            .map_err(|err| {
                FleetError::invalid_params(format!("public key is not valid base64: {}", err))
            })?;
        Self::new(owner_user, algorithm, material, comment)
    }

    /// Parses `"<algorithm> <base64>[ <comment>]"`. The explicit comment wins
    /// over the one in the line; with neither, the default comment is used.
    pub fn from_authorized_key(
        owner_user: impl Into<String>,
        line: &str,
        comment: Option<&str>,
    ) -> Result<Self, FleetError> {
        let normalized = line.replace('\r', "");
        let lines: Vec<&str> = normalized
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if lines.len() != 1 {
            return Err(
                FleetError::invalid_params("public key must be a single key line")
                    .with_hint("Expected: \"<type> <base64> [comment]\"."),
            );
        }
        let line = lines[0];
        if line.contains('\0') {
            return Err(FleetError::invalid_params(
                "public key must not contain null bytes",
            ));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(FleetError::invalid_params("public key has invalid format")
                .with_hint("Expected: \"<type> <base64> [comment]\"."));
        }
        let resolved_comment = comment
            .map(str::to_string)
            .or_else(|| tokens.last().filter(|_| tokens.len() > 2).map(|s| s.to_string()))
            .unwrap_or_else(|| metadata_constants::DEFAULT_KEY_COMMENT.to_string());
        Self::from_base64(owner_user, tokens[0], tokens[1], resolved_comment)
    }

    fn validate(&self) -> Result<(), FleetError> {
        for (field, value) in [
            ("owner_user", &self.owner_user),
            ("algorithm", &self.algorithm),
            ("comment", &self.comment),
        ] {
            if value.trim().is_empty() {
                return Err(FleetError::invalid_params(format!(
                    "credential {} must not be empty",
                    field
                )));
            }
            if value.chars().any(char::is_whitespace) {
                return Err(FleetError::invalid_params(format!(
                    "credential {} must not contain whitespace",
                    field
                )));
            }
        }
        if self.owner_user.contains(':') {
            return Err(FleetError::invalid_params(
                "credential owner_user must not contain ':'",
            ));
        }
        if self.public_key_material.is_empty() {
            return Err(FleetError::invalid_params(
                "credential key material must not be empty",
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> EntryIdentity {
        EntryIdentity::new(&self.owner_user, &self.algorithm, &self.comment)
    }

    pub fn key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.public_key_material)
    }

    /// `"<owner>:<algorithm> <base64> <comment>"`
    pub fn entry_line(&self) -> String {
        format!(
            "{}:{} {} {}",
            self.owner_user,
            self.algorithm,
            self.key_base64(),
            self.comment
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_line_joins_owner_algorithm_key_and_comment() {
        let credential = Credential::from_base64("alice", "ssh-ed25519", "AAAA", "host1")
            .expect("credential");
        assert_eq!(credential.entry_line(), "alice:ssh-ed25519 AAAA host1");
    }

    #[test]
    fn from_authorized_key_prefers_explicit_comment() {
        let credential = Credential::from_authorized_key(
            "bob",
            "ssh-ed25519 AAAA laptop\n",
            Some("fleet"),
        )
        .expect("credential");
        assert_eq!(credential.comment, "fleet");
        assert_eq!(credential.algorithm, "ssh-ed25519");
    }

    #[test]
    fn from_authorized_key_falls_back_to_default_comment() {
        let credential =
            Credential::from_authorized_key("bob", "ssh-ed25519 AAAA", None).expect("credential");
        assert_eq!(credential.comment, "fleetrun");
    }

    #[test]
    fn owner_with_colon_is_rejected() {
        let err = Credential::from_base64("a:b", "ssh-ed25519", "AAAA", "c").unwrap_err();
        assert_eq!(err.kind, crate::errors::FleetErrorKind::InvalidParams);
    }

    #[test]
    fn multi_line_key_is_rejected() {
        assert!(Credential::from_authorized_key(
            "bob",
            "ssh-ed25519 AAAA one\nssh-ed25519 BBBB two",
            None
        )
        .is_err());
    }
}
