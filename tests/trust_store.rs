use fleetrun::errors::{ChannelError, FleetError, FleetErrorKind};
use fleetrun::services::logger::Logger;
use fleetrun::services::trust_store::{HostKeyPolicy, TrustDecision, TrustStore};
use std::sync::Arc;

fn tmp_dir(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

#[test]
fn first_use_pins_and_later_match_is_known() {
    let dir = tmp_dir("fleetrun-trust");
    let path = dir.join("known_hosts");
    let store = TrustStore::open(&path, Logger::new("test")).expect("open");

    let first = store
        .check("10.0.0.1:22", "SHA256:aaa", HostKeyPolicy::Tofu)
        .expect("pin");
    assert_eq!(first, TrustDecision::Pinned);
    let second = store
        .check("10.0.0.1:22", "SHA256:aaa", HostKeyPolicy::Tofu)
        .expect("known");
    assert_eq!(second, TrustDecision::Known);

    let raw = std::fs::read_to_string(&path).expect("file written");
    assert_eq!(raw, "10.0.0.1:22 SHA256:aaa\n");
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn changed_key_is_violation_and_record_is_untouched() {
    let dir = tmp_dir("fleetrun-trust");
    let path = dir.join("known_hosts");
    let store = TrustStore::open(&path, Logger::new("test")).expect("open");
    store
        .check("web:22", "SHA256:old", HostKeyPolicy::Tofu)
        .expect("pin");

    let err = store
        .check("web:22", "SHA256:new", HostKeyPolicy::Tofu)
        .unwrap_err();
    match &err {
        ChannelError::TrustViolation {
            identity,
            expected,
            observed,
        } => {
            assert_eq!(identity, "web:22");
            assert_eq!(expected, "SHA256:old");
            assert_eq!(observed, "SHA256:new");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(FleetError::from(err).kind, FleetErrorKind::TrustViolation);

    assert_eq!(store.get("web:22").as_deref(), Some("SHA256:old"));
    let reloaded = TrustStore::open(&path, Logger::new("test")).expect("reopen");
    assert_eq!(reloaded.get("web:22").as_deref(), Some("SHA256:old"));
    assert!(reloaded
        .check("web:22", "SHA256:new", HostKeyPolicy::Tofu)
        .is_err());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn disabled_policy_skips_without_writing() {
    let dir = tmp_dir("fleetrun-trust");
    let path = dir.join("known_hosts");
    let store = TrustStore::open(&path, Logger::new("test")).expect("open");
    store
        .check("web:22", "SHA256:old", HostKeyPolicy::Tofu)
        .expect("pin");

    let decision = store
        .check("web:22", "SHA256:other", HostKeyPolicy::Disabled)
        .expect("skipped");
    assert_eq!(decision, TrustDecision::Skipped);
    let decision = store
        .check("db:22", "SHA256:db", HostKeyPolicy::Disabled)
        .expect("skipped");
    assert_eq!(decision, TrustDecision::Skipped);
    assert_eq!(store.len(), 1);
    assert!(store.get("db:22").is_none());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn reload_keeps_first_record_per_identity() {
    let dir = tmp_dir("fleetrun-trust");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("known_hosts");
    std::fs::write(
        &path,
        "# pinned hosts\nweb:22 SHA256:first\n\nweb:22 SHA256:second\ndb:22 SHA256:db\n",
    )
    .unwrap();
    let store = TrustStore::open(&path, Logger::new("test")).expect("open");
    assert_eq!(store.len(), 2);
    assert_eq!(store.get("web:22").as_deref(), Some("SHA256:first"));
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn concurrent_first_contacts_pin_once() {
    let dir = tmp_dir("fleetrun-trust");
    let path = dir.join("known_hosts");
    let store = Arc::new(TrustStore::open(&path, Logger::new("test")).expect("open"));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let host = format!("10.0.0.{}:22", i % 4);
                store.check(&host, &format!("SHA256:{}", i % 4), HostKeyPolicy::Tofu)
            })
        })
        .collect();
    let decisions: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().expect("no violation"))
        .collect();

    let pinned = decisions
        .iter()
        .filter(|d| **d == TrustDecision::Pinned)
        .count();
    assert_eq!(pinned, 4);
    let raw = std::fs::read_to_string(&path).unwrap();
    assert_eq!(raw.lines().count(), 4);
    let _ = std::fs::remove_dir_all(dir);
}
