use super::credential::EntryIdentity;
use crate::errors::FleetError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which metadata resource a credential is reconciled into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum MetadataScope {
    Project { project: String },
    Host { project: String, host: String },
}

impl MetadataScope {
    pub fn project(project: impl Into<String>) -> Self {
        MetadataScope::Project {
            project: project.into(),
        }
    }

    pub fn host(project: impl Into<String>, host: impl Into<String>) -> Self {
        MetadataScope::Host {
            project: project.into(),
            host: host.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            MetadataScope::Project { project } => format!("project/{}", project),
            MetadataScope::Host { project, host } => format!("project/{}/host/{}", project, host),
        }
    }
}

impl fmt::Display for MetadataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

impl MetadataItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A metadata resource as served by the credential store, together with
/// the fingerprint that guards the next write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MetadataResource {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
    #[serde(default)]
    pub fingerprint: String,
}

impl MetadataResource {
    pub fn item(&self, key: &str) -> Option<&MetadataItem> {
        self.items.iter().find(|item| item.key == key)
    }

    /// Replaces the value of `key` in place, appending the item when absent.
    /// Every other item keeps its position and bytes.
    pub fn set_item(&mut self, key: &str, value: String) {
        match self.items.iter_mut().find(|item| item.key == key) {
            Some(item) => item.value = value,
            None => self.items.push(MetadataItem::new(key, value)),
        }
    }
}

/// One `"<owner>:<algorithm> <base64> <comment>"` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    line: String,
    identity: EntryIdentity,
}

impl MetadataEntry {
    /// Header is the first whitespace token, split on its first `:`. The
    /// comment is the last token when the line has three or more tokens.
    pub fn parse(line: &str) -> Result<Self, FleetError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(FleetError::reconciliation(format!(
                "malformed ssh key entry (expected '<user>:<algorithm> <key> <comment>'): {}",
                line
            )));
        }
        let (owner, algorithm) = tokens[0].split_once(':').ok_or_else(|| {
            FleetError::reconciliation(format!(
                "malformed ssh key entry header (missing ':'): {}",
                tokens[0]
            ))
        })?;
        if owner.is_empty() || algorithm.is_empty() {
            return Err(FleetError::reconciliation(format!(
                "malformed ssh key entry header: {}",
                tokens[0]
            )));
        }
        let comment = if tokens.len() > 2 {
            tokens[tokens.len() - 1]
        } else {
            ""
        };
        Ok(Self {
            line: line.to_string(),
            identity: EntryIdentity::new(owner, algorithm, comment),
        })
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn identity(&self) -> &EntryIdentity {
        &self.identity
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlobLine {
    Entry(MetadataEntry),
    // Blank lines carry no identity but are kept so untouched slots
    // serialize back byte-for-byte.
    Blank(String),
}

impl BlobLine {
    fn text(&self) -> &str {
        match self {
            BlobLine::Entry(entry) => entry.line(),
            BlobLine::Blank(raw) => raw,
        }
    }
}

/// The ordered, newline-delimited list of key entries stored in the
/// `ssh-keys` metadata item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyBlob {
    lines: Vec<BlobLine>,
}

impl KeyBlob {
    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let mut lines = Vec::new();
        for line in raw.split('\n') {
            if line.trim().is_empty() {
                lines.push(BlobLine::Blank(line.to_string()));
            } else {
                lines.push(BlobLine::Entry(MetadataEntry::parse(line)?));
            }
        }
        Ok(Self { lines })
    }

    pub fn serialize(&self) -> String {
        self.lines
            .iter()
            .map(BlobLine::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.lines.iter().filter_map(|line| match line {
            BlobLine::Entry(entry) => Some(entry),
            BlobLine::Blank(_) => None,
        })
    }

    /// Linear search for the slot holding `identity`.
    pub fn position(&self, identity: &EntryIdentity) -> Option<usize> {
        self.lines.iter().position(|line| match line {
            BlobLine::Entry(entry) => entry.identity() == identity,
            BlobLine::Blank(_) => false,
        })
    }

    pub fn line_at(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(BlobLine::text)
    }

    /// Appends `entry` and returns the line index it landed at.
    pub fn push(&mut self, entry: MetadataEntry) -> usize {
        // A trailing blank slot is the artefact of a terminating newline;
        // keep the newline after the appended entry instead of before it.
        if matches!(self.lines.last(), Some(BlobLine::Blank(raw)) if raw.is_empty()) {
            let at = self.lines.len() - 1;
            self.lines.insert(at, BlobLine::Entry(entry));
            at
        } else {
            self.lines.push(BlobLine::Entry(entry));
            self.lines.len() - 1
        }
    }

    pub fn replace(&mut self, index: usize, entry: MetadataEntry) {
        if let Some(slot) = self.lines.get_mut(index) {
            *slot = BlobLine::Entry(entry);
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<MetadataEntry> {
        if index >= self.lines.len() {
            return None;
        }
        match self.lines.remove(index) {
            BlobLine::Entry(entry) => Some(entry),
            BlobLine::Blank(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_parse_extracts_identity() {
        let entry = MetadataEntry::parse("alice:ssh-ed25519 AAAA host1").expect("entry");
        assert_eq!(
            entry.identity(),
            &EntryIdentity::new("alice", "ssh-ed25519", "host1")
        );
    }

    #[test]
    fn entry_parse_uses_last_token_as_comment() {
        let entry =
            MetadataEntry::parse("bob:ssh-rsa AAAA extra words here").expect("entry");
        assert_eq!(entry.identity().comment, "here");
    }

    #[test]
    fn entry_without_comment_has_empty_comment() {
        let entry = MetadataEntry::parse("bob:ssh-rsa AAAA").expect("entry");
        assert_eq!(entry.identity().comment, "");
    }

    #[test]
    fn entry_without_colon_is_malformed() {
        let err = MetadataEntry::parse("ssh-rsa AAAA bob").unwrap_err();
        assert_eq!(err.kind, crate::errors::FleetErrorKind::Reconciliation);
    }

    #[test]
    fn blob_round_trips_trailing_newline_and_blank_lines() {
        let raw = "a:ssh-rsa K1 c1\n\nb:ssh-rsa K2 c2\n";
        let blob = KeyBlob::parse(raw).expect("blob");
        assert_eq!(blob.serialize(), raw);
        assert_eq!(blob.entries().count(), 2);
    }

    #[test]
    fn push_keeps_terminating_newline_last() {
        let mut blob = KeyBlob::parse("a:ssh-rsa K1 c1\n").expect("blob");
        let index = blob.push(MetadataEntry::parse("b:ssh-rsa K2 c2").expect("entry"));
        assert_eq!(index, 1);
        assert_eq!(blob.serialize(), "a:ssh-rsa K1 c1\nb:ssh-rsa K2 c2\n");
    }

    #[test]
    fn push_after_blank_lines_reports_line_index() {
        let mut blob = KeyBlob::parse("a:ssh-rsa K1 c1\n\n").expect("blob");
        let index = blob.push(MetadataEntry::parse("b:ssh-rsa K2 c2").expect("entry"));
        assert_eq!(blob.line_at(index), Some("b:ssh-rsa K2 c2"));
    }

    #[test]
    fn set_item_preserves_other_items_order() {
        let mut resource = MetadataResource {
            items: vec![
                MetadataItem::new("startup-script", "echo hi"),
                MetadataItem::new("ssh-keys", "old"),
                MetadataItem::new("zone", "eu"),
            ],
            fingerprint: "f1".into(),
        };
        resource.set_item("ssh-keys", "new".into());
        resource.set_item("enable-oslogin", "false".into());
        let keys: Vec<&str> = resource.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["startup-script", "ssh-keys", "zone", "enable-oslogin"]
        );
        assert_eq!(resource.item("ssh-keys").map(|i| i.value.as_str()), Some("new"));
    }
}
