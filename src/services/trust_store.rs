use crate::errors::{ChannelError, FleetError};
use crate::model::TrustRecord;
use crate::services::logger::Logger;
use crate::utils::fs_atomic::append_line_synced;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Trust on first use, reject any later change.
    Tofu,
    /// Operator accepted the risk for this run; nothing is checked or written.
    Disabled,
}

impl HostKeyPolicy {
    pub fn from_verify_flag(verify: bool) -> Self {
        if verify {
            HostKeyPolicy::Tofu
        } else {
            HostKeyPolicy::Disabled
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustDecision {
    /// Fingerprint matched the pinned record.
    Known,
    /// No record existed; the observed fingerprint is now pinned.
    Pinned,
    /// Verification disabled for the run.
    Skipped,
}

/// Persisted `identity -> host key fingerprint` map. Records are appended,
/// never rewritten; the first record for an identity wins on reload.
#[derive(Clone)]
pub struct TrustStore {
    logger: Logger,
    file_path: Option<PathBuf>,
    records: Arc<DashMap<String, String>>,
    append_lock: Arc<Mutex<()>>,
}

impl TrustStore {
    pub fn open(path: impl AsRef<Path>, logger: Logger) -> Result<Self, FleetError> {
        let store = Self {
            logger: logger.child("trust"),
            file_path: Some(path.as_ref().to_path_buf()),
            records: Arc::new(DashMap::new()),
            append_lock: Arc::new(Mutex::new(())),
        };
        store.load()?;
        Ok(store)
    }

    pub fn in_memory(logger: Logger) -> Self {
        Self {
            logger: logger.child("trust"),
            file_path: None,
            records: Arc::new(DashMap::new()),
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    fn load(&self) -> Result<(), FleetError> {
        let Some(path) = self.file_path.as_ref() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path).map_err(|err| {
            FleetError::internal(format!("Failed to load known hosts {}: {}", path.display(), err))
        })?;
        for line in raw.lines() {
            if let Some(record) = TrustRecord::parse_line(line) {
                self.records
                    .entry(record.identity)
                    .or_insert(record.fingerprint);
            }
        }
        Ok(())
    }

    pub fn get(&self, identity: &str) -> Option<String> {
        self.records.get(identity).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Applies the trust-on-first-use transition for one connection attempt.
    /// The map entry stays locked for the whole read-check-write, so two
    /// workers racing on the same identity cannot both pin.
    pub fn check(
        &self,
        identity: &str,
        observed: &str,
        policy: HostKeyPolicy,
    ) -> Result<TrustDecision, ChannelError> {
        if policy == HostKeyPolicy::Disabled {
            return Ok(TrustDecision::Skipped);
        }
        match self.records.entry(identity.to_string()) {
            Entry::Occupied(existing) => {
                if existing.get() == observed {
                    return Ok(TrustDecision::Known);
                }
                self.logger.error(
                    "host key mismatch",
                    Some(&serde_json::json!({
                        "identity": identity,
                        "expected": existing.get(),
                        "observed": observed,
                    })),
                );
                Err(ChannelError::TrustViolation {
                    identity: identity.to_string(),
                    expected: existing.get().clone(),
                    observed: observed.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                self.persist(&TrustRecord::new(identity, observed))?;
                slot.insert(observed.to_string());
                self.logger.warn(
                    "trusting new host key",
                    Some(&serde_json::json!({
                        "identity": identity,
                        "fingerprint": observed,
                    })),
                );
                Ok(TrustDecision::Pinned)
            }
        }
    }

    fn persist(&self, record: &TrustRecord) -> Result<(), ChannelError> {
        let Some(path) = self.file_path.as_ref() else {
            return Ok(());
        };
        let _guard = self.append_lock.lock().unwrap_or_else(|err| err.into_inner());
        append_line_synced(path, &record.to_line(), 0o600).map_err(|err| {
            ChannelError::transport(format!(
                "failed to record host key for {}: {}",
                record.identity, err
            ))
        })
    }
}
