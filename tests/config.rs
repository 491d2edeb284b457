mod common;
use common::ENV_LOCK;

use fleetrun::errors::FleetErrorKind;
use fleetrun::services::config::{FleetConfig, TransportKind};

fn tmp_dir(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

fn clear_env() {
    for key in [
        "FLEETRUN_CONCURRENCY",
        "FLEETRUN_CONNECT_TIMEOUT_MS",
        "FLEETRUN_INSECURE",
        "FLEETRUN_CONFIG",
    ] {
        std::env::remove_var(key);
    }
}

#[tokio::test]
async fn missing_file_yields_defaults() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let config = FleetConfig::load(Some(tmp_dir("fleetrun-cfg").join("config.json").as_path()))
        .expect("defaults");
    assert_eq!(config.concurrency, 100);
    assert_eq!(config.connect_timeout_ms, 10_000);
    assert!(config.verify_host_keys);
    assert_eq!(config.transport, TransportKind::Tunneled);
    assert_eq!(config.agent_port, 1337);
    assert!(!config.retry_conflicts);
}

#[tokio::test]
async fn file_values_then_env_overrides() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = tmp_dir("fleetrun-cfg");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.json");
    std::fs::write(
        &path,
        r#"{"project": "ops", "concurrency": 5, "transport": "direct_tls", "tls": {"ca": "~/ca.pem"}}"#,
    )
    .unwrap();

    std::env::set_var("FLEETRUN_CONCURRENCY", "12");
    std::env::set_var("FLEETRUN_INSECURE", "1");
    let config = FleetConfig::load(Some(path.as_path())).expect("config");
    clear_env();

    assert_eq!(config.project, "ops");
    assert_eq!(config.concurrency, 12);
    assert!(!config.verify_host_keys);
    assert_eq!(config.transport, TransportKind::DirectTls);
    let ca = config.tls.ca.expect("ca path");
    assert!(!ca.to_string_lossy().starts_with('~'));
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn zero_concurrency_is_invalid() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    std::env::set_var("FLEETRUN_CONCURRENCY", "0");
    let err = FleetConfig::load(Some(tmp_dir("fleetrun-cfg").join("config.json").as_path())).unwrap_err();
    clear_env();
    assert_eq!(err.kind, FleetErrorKind::InvalidParams);
}

#[test]
fn transport_names_parse() {
    assert_eq!(TransportKind::parse("direct-tls").unwrap(), TransportKind::DirectTls);
    assert_eq!(TransportKind::parse("SSH").unwrap(), TransportKind::Tunneled);
    assert!(TransportKind::parse("carrier-pigeon").is_err());
}

#[tokio::test]
async fn init_writes_defaults_once_and_they_load_back() {
    let _guard = ENV_LOCK.lock().await;
    clear_env();
    let dir = tmp_dir("fleetrun-init");
    let path = dir.join("nested").join("config.json");

    let (written_to, created) = FleetConfig::write_default(Some(path.as_path())).expect("init");
    assert!(created);
    assert_eq!(written_to, path);
    let loaded = FleetConfig::load(Some(path.as_path())).expect("load");
    assert_eq!(loaded, FleetConfig::default());

    std::fs::write(&path, r#"{"project": "ops"}"#).unwrap();
    let (_, created) = FleetConfig::write_default(Some(path.as_path())).expect("init again");
    assert!(!created);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"project": "ops"}"#);
    let _ = std::fs::remove_dir_all(dir);
}
