use crate::errors::FleetError;
use crate::model::{MetadataItem, MetadataResource, MetadataScope};
use crate::services::metadata_store::MetadataStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoredResource {
    pub(crate) items: Vec<MetadataItem>,
    pub(crate) generation: u64,
}

impl StoredResource {
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.generation.to_be_bytes());
        for item in &self.items {
            hasher.update(item.key.as_bytes());
            hasher.update([0u8]);
            hasher.update(item.value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..8])
    }

    fn to_resource(&self) -> MetadataResource {
        MetadataResource {
            items: self.items.clone(),
            fingerprint: self.fingerprint(),
        }
    }
}

/// In-process metadata store with compare-and-swap writes.
#[derive(Clone, Default)]
pub struct MemoryMetadataStore {
    resources: Arc<RwLock<BTreeMap<String, StoredResource>>>,
    writes: Arc<AtomicUsize>,
    pending_conflicts: Arc<AtomicUsize>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, scope: &MetadataScope, items: Vec<MetadataItem>) {
        let mut guard = self.resources.write().unwrap_or_else(|err| err.into_inner());
        let entry = guard.entry(scope.storage_key()).or_default();
        entry.items = items;
        entry.generation += 1;
    }

    pub fn snapshot(&self, scope: &MetadataScope) -> MetadataResource {
        let guard = self.resources.read().unwrap_or_else(|err| err.into_inner());
        guard
            .get(&scope.storage_key())
            .map(StoredResource::to_resource)
            .unwrap_or_else(|| StoredResource::default().to_resource())
    }

    pub fn item_value(&self, scope: &MetadataScope, key: &str) -> Option<String> {
        self.snapshot(scope).item(key).map(|item| item.value.clone())
    }

    /// Number of accepted writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes the next `count` writes behave as if another writer committed
    /// first: the stored generation advances and the write is rejected.
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub(crate) fn export(&self) -> BTreeMap<String, StoredResource> {
        self.resources
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub(crate) fn import(&self, data: BTreeMap<String, StoredResource>) {
        let mut guard = self.resources.write().unwrap_or_else(|err| err.into_inner());
        *guard = data;
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn compare_and_set(
        &self,
        scope: &MetadataScope,
        items: Vec<MetadataItem>,
        fingerprint: &str,
    ) -> Result<(), FleetError> {
        let mut guard = self.resources.write().unwrap_or_else(|err| err.into_inner());
        let entry = guard.entry(scope.storage_key()).or_default();
        if self.take_injected_conflict() {
            entry.generation += 1;
        }
        let current = entry.fingerprint();
        if current != fingerprint {
            return Err(FleetError::concurrency_conflict(format!(
                "metadata for {} changed concurrently (expected fingerprint {}, found {})",
                scope, fingerprint, current
            ))
            .with_hint("Re-run the command to reconcile against the latest metadata."));
        }
        entry.items = items;
        entry.generation += 1;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_metadata(&self, scope: &MetadataScope) -> Result<MetadataResource, FleetError> {
        Ok(self.snapshot(scope))
    }

    async fn set_metadata(
        &self,
        scope: &MetadataScope,
        items: Vec<MetadataItem>,
        fingerprint: &str,
    ) -> Result<(), FleetError> {
        self.compare_and_set(scope, items, fingerprint)
    }
}
