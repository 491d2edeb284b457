use fleetrun::errors::FleetErrorKind;
use fleetrun::services::directory::{InventoryDirectory, TargetDirectory};

fn tmp_dir(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

const INVENTORY: &str = r#"{
  "targets": [
    {"name": "web-1", "public_address": "203.0.113.10", "private_address": "10.0.0.10", "labels": {"role": "web", "env": "prod"}},
    {"name": "web-2", "public_address": "203.0.113.11", "labels": {"role": "web", "env": "staging"}},
    {"name": "db-1", "public_address": "203.0.113.20", "labels": {"role": "db", "env": "prod"}}
  ]
}"#;

#[tokio::test]
async fn filter_selects_matching_targets_in_inventory_order() {
    let directory = InventoryDirectory::parse(INVENTORY).expect("inventory");
    let names: Vec<String> = directory
        .list(r#"labels.env == "prod""#)
        .await
        .expect("list")
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["web-1", "db-1"]);

    let all = directory.list("").await.expect("list");
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn bare_array_inventory_loads_from_file() {
    let dir = tmp_dir("fleetrun-inventory");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("inventory.json");
    std::fs::write(
        &path,
        r#"[{"name": "a", "public_address": "192.0.2.1"}, {"name": "b"}]"#,
    )
    .unwrap();

    let directory = InventoryDirectory::load(&path).expect("load");
    assert_eq!(directory.source(), Some(path.as_path()));
    let targets = directory.list("name =~ \"^b$\"").await.expect("list");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].address(false), None);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn bad_filter_is_directory_error() {
    let directory = InventoryDirectory::parse(INVENTORY).expect("inventory");
    let err = directory.list("labels.role ==").await.unwrap_err();
    assert_eq!(err.kind, FleetErrorKind::Directory);
}

#[test]
fn duplicate_names_are_rejected() {
    let err = InventoryDirectory::parse(r#"[{"name": "a"}, {"name": "a"}]"#).unwrap_err();
    assert_eq!(err.kind, FleetErrorKind::Directory);
    assert!(err.message.contains("Duplicate"));
}

#[test]
fn missing_inventory_file_is_directory_error() {
    let err = InventoryDirectory::load(tmp_dir("fleetrun-missing").join("inventory.json"))
        .unwrap_err();
    assert_eq!(err.kind, FleetErrorKind::Directory);
}
