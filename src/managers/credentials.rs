use crate::constants::metadata as metadata_constants;
use crate::errors::{FleetError, FleetErrorKind};
use crate::model::{Credential, KeyBlob, MetadataEntry, MetadataScope};
use crate::services::logger::Logger;
use crate::services::metadata_store::MetadataStore;
use crate::services::retry::RetryPolicy;
use std::sync::Arc;

/// The mutation a reconciliation applied (or decided not to apply).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    Appended { index: usize },
    Replaced { index: usize },
    Removed { index: usize },
    /// Upsert found an identical line; nothing was written.
    Unchanged,
    /// Remove found no matching entry; nothing was written.
    Absent,
}

impl Reconciliation {
    pub fn wrote(self) -> bool {
        matches!(
            self,
            Reconciliation::Appended { .. }
                | Reconciliation::Replaced { .. }
                | Reconciliation::Removed { .. }
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Reconciliation::Appended { .. } => "appended",
            Reconciliation::Replaced { .. } => "replaced",
            Reconciliation::Removed { .. } => "removed",
            Reconciliation::Unchanged => "unchanged",
            Reconciliation::Absent => "absent",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Upsert,
    Remove,
}

/// Applies `credential` to `blob` in place.
pub fn upsert_entry(blob: &mut KeyBlob, credential: &Credential) -> Result<Reconciliation, FleetError> {
    let line = credential.entry_line();
    let entry = MetadataEntry::parse(&line)?;
    match blob.position(&credential.identity()) {
        None => {
            let index = blob.push(entry);
            Ok(Reconciliation::Appended { index })
        }
        Some(index) if blob.line_at(index) == Some(line.as_str()) => Ok(Reconciliation::Unchanged),
        Some(index) => {
            blob.replace(index, entry);
            Ok(Reconciliation::Replaced { index })
        }
    }
}

/// Drops the entry matching `credential`'s identity from `blob`, if any.
pub fn remove_entry(blob: &mut KeyBlob, credential: &Credential) -> Reconciliation {
    match blob.position(&credential.identity()) {
        Some(index) => {
            blob.remove(index);
            Reconciliation::Removed { index }
        }
        None => Reconciliation::Absent,
    }
}

/// Text-level upsert over a raw `ssh-keys` value.
pub fn upsert_blob(raw: &str, credential: &Credential) -> Result<String, FleetError> {
    let mut blob = KeyBlob::parse(raw)?;
    upsert_entry(&mut blob, credential)?;
    Ok(blob.serialize())
}

/// Text-level removal over a raw `ssh-keys` value.
pub fn remove_blob(raw: &str, credential: &Credential) -> Result<String, FleetError> {
    let mut blob = KeyBlob::parse(raw)?;
    remove_entry(&mut blob, credential);
    Ok(blob.serialize())
}

/// Keeps one SSH key entry in a shared metadata resource up to date.
///
/// Writes are optimistic: the fingerprint read with the resource is sent
/// back with the update and a stale one surfaces as `ConcurrencyConflict`.
/// Conflicts are only retried when a retry policy is configured.
#[derive(Clone)]
pub struct CredentialReconciler {
    logger: Logger,
    store: Arc<dyn MetadataStore>,
    conflict_retry: Option<RetryPolicy>,
}

impl CredentialReconciler {
    pub fn new(logger: Logger, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            logger: logger.child("credentials"),
            store,
            conflict_retry: None,
        }
    }

    /// Re-fetches and recomputes on `ConcurrencyConflict` under `policy`.
    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = Some(policy);
        self
    }

    pub async fn upsert(
        &self,
        scope: &MetadataScope,
        credential: &Credential,
    ) -> Result<Reconciliation, FleetError> {
        self.reconcile(scope, credential, Mode::Upsert).await
    }

    pub async fn remove(
        &self,
        scope: &MetadataScope,
        credential: &Credential,
    ) -> Result<Reconciliation, FleetError> {
        self.reconcile(scope, credential, Mode::Remove).await
    }

    async fn reconcile(
        &self,
        scope: &MetadataScope,
        credential: &Credential,
        mode: Mode,
    ) -> Result<Reconciliation, FleetError> {
        match self.conflict_retry.as_ref() {
            None => self.reconcile_once(scope, credential, mode).await,
            Some(policy) => {
                policy
                    .run_async(
                        |err: &FleetError| err.kind == FleetErrorKind::ConcurrencyConflict,
                        |attempt| async move {
                            if attempt > 1 {
                                self.logger.info(
                                    "retrying metadata write after conflict",
                                    Some(&serde_json::json!({
                                        "scope": scope.storage_key(),
                                        "attempt": attempt,
                                    })),
                                );
                            }
                            self.reconcile_once(scope, credential, mode).await
                        },
                    )
                    .await
            }
        }
    }

    async fn reconcile_once(
        &self,
        scope: &MetadataScope,
        credential: &Credential,
        mode: Mode,
    ) -> Result<Reconciliation, FleetError> {
        let mut resource = self
            .store
            .get_metadata(scope)
            .await
            .map_err(|err| wrap_store_error("fetch", scope, err))?;
        let fingerprint = resource.fingerprint.clone();
        let raw = resource
            .item(metadata_constants::SSH_KEYS_ITEM)
            .map(|item| item.value.clone())
            .unwrap_or_default();
        let mut blob = KeyBlob::parse(&raw).map_err(|err| {
            FleetError::reconciliation(format!(
                "existing {} in {} is malformed: {}",
                metadata_constants::SSH_KEYS_ITEM,
                scope,
                err.message
            ))
        })?;

        let outcome = match mode {
            Mode::Upsert => upsert_entry(&mut blob, credential)?,
            Mode::Remove => remove_entry(&mut blob, credential),
        };
        let meta = serde_json::json!({
            "scope": scope.storage_key(),
            "owner": credential.owner_user,
            "comment": credential.comment,
            "result": outcome.label(),
        });
        if !outcome.wrote() {
            self.logger.info("metadata already reconciled", Some(&meta));
            return Ok(outcome);
        }

        resource.set_item(metadata_constants::SSH_KEYS_ITEM, blob.serialize());
        self.store
            .set_metadata(scope, resource.items, &fingerprint)
            .await
            .map_err(|err| wrap_store_error("write", scope, err))?;
        self.logger.info("metadata updated", Some(&meta));
        Ok(outcome)
    }
}

fn wrap_store_error(stage: &str, scope: &MetadataScope, err: FleetError) -> FleetError {
    if err.is_reconciliation() {
        return err;
    }
    let mut wrapped = FleetError::reconciliation(format!(
        "metadata {} for {} failed: {}",
        stage, scope, err.message
    ));
    wrapped.hint = err.hint;
    wrapped
}
