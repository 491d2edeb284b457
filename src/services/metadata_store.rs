use crate::errors::FleetError;
use crate::model::{MetadataItem, MetadataResource, MetadataScope};
use async_trait::async_trait;

/// Remote holder of metadata resources, guarded by an opaque fingerprint.
///
/// `set_metadata` must fail with `ConcurrencyConflict` when `fingerprint` no
/// longer matches the stored resource.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_metadata(&self, scope: &MetadataScope) -> Result<MetadataResource, FleetError>;

    async fn set_metadata(
        &self,
        scope: &MetadataScope,
        items: Vec<MetadataItem>,
        fingerprint: &str,
    ) -> Result<(), FleetError>;
}
