use fleetrun::errors::FleetErrorKind;
use fleetrun::managers::credentials::{CredentialReconciler, Reconciliation};
use fleetrun::model::{Credential, MetadataItem, MetadataScope};
use fleetrun::services::logger::Logger;
use fleetrun::services::metadata_store::MetadataStore;
use fleetrun::stores::file_metadata_store::FileMetadataStore;
use std::sync::Arc;

fn tmp_dir(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

#[tokio::test]
async fn writes_survive_reopen_with_same_fingerprint() {
    let dir = tmp_dir("fleetrun-meta");
    let path = dir.join("metadata.json");
    let scope = MetadataScope::project("demo");

    let store = FileMetadataStore::open(&path).expect("open");
    let before = store.get_metadata(&scope).await.expect("get");
    store
        .set_metadata(
            &scope,
            vec![MetadataItem::new("ssh-keys", "alice:ssh-ed25519 AAAA host1")],
            &before.fingerprint,
        )
        .await
        .expect("set");
    let after = store.get_metadata(&scope).await.expect("get");
    assert_ne!(before.fingerprint, after.fingerprint);

    let reopened = FileMetadataStore::open(&path).expect("reopen");
    let loaded = reopened.get_metadata(&scope).await.expect("get");
    assert_eq!(loaded, after);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn stale_fingerprint_is_conflict_and_nothing_is_written() {
    let dir = tmp_dir("fleetrun-meta");
    let path = dir.join("metadata.json");
    let scope = MetadataScope::host("demo", "web-1");
    let store = FileMetadataStore::open(&path).expect("open");
    let stale = store.get_metadata(&scope).await.expect("get").fingerprint;
    store
        .set_metadata(&scope, vec![MetadataItem::new("a", "1")], &stale)
        .await
        .expect("first write");

    let err = store
        .set_metadata(&scope, vec![MetadataItem::new("a", "2")], &stale)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FleetErrorKind::ConcurrencyConflict);
    assert!(err.retryable);
    let current = store.get_metadata(&scope).await.expect("get");
    assert_eq!(current.items, vec![MetadataItem::new("a", "1")]);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn two_reconcilers_on_one_resource_keep_both_entries() {
    let dir = tmp_dir("fleetrun-meta");
    let store = Arc::new(FileMetadataStore::open(dir.join("metadata.json")).expect("open"));
    let scope = MetadataScope::project("demo");
    let alice = Credential::from_base64("alice", "ssh-ed25519", "AAAA", "laptop").unwrap();
    let bob = Credential::from_base64("bob", "ssh-rsa", "BBBB", "desk").unwrap();

    let first = CredentialReconciler::new(Logger::new("test"), store.clone());
    let second = CredentialReconciler::new(Logger::new("test"), store.clone());
    assert_eq!(
        first.upsert(&scope, &alice).await.unwrap(),
        Reconciliation::Appended { index: 0 }
    );
    assert_eq!(
        second.upsert(&scope, &bob).await.unwrap(),
        Reconciliation::Appended { index: 1 }
    );
    let value = store.inner().item_value(&scope, "ssh-keys").unwrap();
    assert_eq!(value, "alice:ssh-ed25519 AAAA laptop\nbob:ssh-rsa BBBB desk");
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn second_process_with_old_fingerprint_gets_conflict() {
    let dir = tmp_dir("fleetrun-meta");
    let path = dir.join("metadata.json");
    let scope = MetadataScope::project("demo");
    let first = FileMetadataStore::open(&path).expect("open first");
    let second = FileMetadataStore::open(&path).expect("open second");
    let seen_by_first = first.get_metadata(&scope).await.expect("get").fingerprint;
    let seen_by_second = second.get_metadata(&scope).await.expect("get").fingerprint;
    assert_eq!(seen_by_first, seen_by_second);

    first
        .set_metadata(&scope, vec![MetadataItem::new("ssh-keys", "alice:ssh-ed25519 AAAA a")], &seen_by_first)
        .await
        .expect("first write");
    let err = second
        .set_metadata(&scope, vec![MetadataItem::new("ssh-keys", "bob:ssh-ed25519 BBBB b")], &seen_by_second)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FleetErrorKind::ConcurrencyConflict);

    let current = second.get_metadata(&scope).await.expect("fresh read");
    assert_eq!(current.items, vec![MetadataItem::new("ssh-keys", "alice:ssh-ed25519 AAAA a")]);
    assert!(!first.lock_path().exists(), "lock is released after each write");
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn held_lock_times_out_without_writing() {
    let dir = tmp_dir("fleetrun-meta");
    let path = dir.join("metadata.json");
    let scope = MetadataScope::project("demo");
    let store = FileMetadataStore::open(&path)
        .expect("open")
        .with_lock_wait(std::time::Duration::from_millis(100));
    let fingerprint = store.get_metadata(&scope).await.expect("get").fingerprint;
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(store.lock_path(), "4242\n").unwrap();

    let err = store
        .set_metadata(&scope, vec![MetadataItem::new("a", "1")], &fingerprint)
        .await
        .unwrap_err();
    assert_eq!(err.kind, FleetErrorKind::Timeout);
    assert!(!path.exists());
    assert!(store.lock_path().exists(), "someone else's lock is left alone");
    let _ = std::fs::remove_dir_all(dir);
}
