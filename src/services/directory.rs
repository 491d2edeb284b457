use crate::errors::FleetError;
use crate::model::Target;
use crate::utils::target_filter::TargetFilter;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Resolves a selection expression to the targets of a run.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn list(&self, filter: &str) -> Result<Vec<Target>, FleetError>;
}

/// Directory backed by a JSON inventory: either an array of targets or an
/// object with a `targets` array.
#[derive(Clone, Debug)]
pub struct InventoryDirectory {
    source: Option<PathBuf>,
    targets: Vec<Target>,
}

impl InventoryDirectory {
    pub fn from_targets(targets: Vec<Target>) -> Result<Self, FleetError> {
        ensure_unique_names(&targets)?;
        Ok(Self {
            source: None,
            targets,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            FleetError::directory(format!(
                "Failed to read inventory {}: {}",
                path.display(),
                err
            ))
        })?;
        let mut dir = Self::parse(&raw)?;
        dir.source = Some(path.to_path_buf());
        Ok(dir)
    }

    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        let parsed: Value = serde_json::from_str(raw)
            .map_err(|err| FleetError::directory(format!("Failed to parse inventory: {}", err)))?;
        let list = match parsed {
            Value::Array(_) => parsed,
            Value::Object(mut obj) => obj.remove("targets").unwrap_or(Value::Array(Vec::new())),
            _ => {
                return Err(FleetError::directory(
                    "Inventory must be an array or an object with a targets array",
                ))
            }
        };
        let targets: Vec<Target> = serde_json::from_value(list)
            .map_err(|err| FleetError::directory(format!("Invalid inventory entry: {}", err)))?;
        Self::from_targets(targets)
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn ensure_unique_names(targets: &[Target]) -> Result<(), FleetError> {
    let mut seen = HashSet::new();
    for target in targets {
        if target.name.trim().is_empty() {
            return Err(FleetError::directory("Inventory target with empty name"));
        }
        if !seen.insert(target.name.as_str()) {
            return Err(FleetError::directory(format!(
                "Duplicate target name '{}' in inventory",
                target.name
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl TargetDirectory for InventoryDirectory {
    async fn list(&self, filter: &str) -> Result<Vec<Target>, FleetError> {
        let filter = TargetFilter::parse(filter)?;
        Ok(filter.select(self.targets.clone()))
    }
}
