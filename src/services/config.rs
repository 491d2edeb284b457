use crate::constants::{limits, network};
use crate::errors::FleetError;
use crate::services::retry::RetryPolicy;
use crate::utils::fs_atomic::atomic_write_text_file;
use crate::utils::paths::{
    expand_home_path, resolve_config_path, resolve_inventory_path, resolve_known_hosts_path,
    resolve_metadata_path, resolve_private_key_path, resolve_public_key_path,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// SSH to the target; commands over exec, agent calls over a forwarded
    /// loopback port.
    #[default]
    Tunneled,
    /// Mutual TLS straight to the agent port.
    DirectTls,
}

impl TransportKind {
    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "tunneled" | "ssh" => Ok(TransportKind::Tunneled),
            "direct_tls" | "tls" => Ok(TransportKind::DirectTls),
            other => Err(FleetError::invalid_params(format!(
                "Unknown transport: {}",
                other
            ))
            .with_hint("Use one of: tunneled, direct-tls.")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsPaths {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub project: String,
    pub concurrency: usize,
    pub connect_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    pub verify_host_keys: bool,
    pub transport: TransportKind,
    pub use_private_address: bool,
    pub ssh_user: Option<String>,
    pub ssh_port: u16,
    pub agent_port: u16,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub known_hosts_path: PathBuf,
    pub inventory_path: PathBuf,
    pub metadata_path: PathBuf,
    pub tls: TlsPaths,
    pub auth_retry: RetryPolicy,
    pub retry_conflicts: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            concurrency: limits::DEFAULT_CONCURRENCY,
            connect_timeout_ms: network::TIMEOUT_CONNECT_MS,
            exec_timeout_ms: network::TIMEOUT_EXEC_DEFAULT_MS,
            verify_host_keys: true,
            transport: TransportKind::default(),
            use_private_address: false,
            ssh_user: None,
            ssh_port: network::SSH_DEFAULT_PORT,
            agent_port: network::AGENT_DEFAULT_PORT,
            private_key_path: resolve_private_key_path(),
            public_key_path: resolve_public_key_path(),
            known_hosts_path: resolve_known_hosts_path(),
            inventory_path: resolve_inventory_path(),
            metadata_path: resolve_metadata_path(),
            tls: TlsPaths::default(),
            auth_retry: RetryPolicy::auth_propagation(),
            retry_conflicts: false,
        }
    }
}

fn read_env_u64(name: &str) -> Result<Option<u64>, FleetError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            FleetError::invalid_params(format!("{} must be a positive integer", name))
        }),
        _ => Ok(None),
    }
}

fn read_env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl FleetConfig {
    /// Loads `path` (or the default location), then applies `FLEETRUN_*`
    /// environment overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, FleetError> {
        let path = path
            .map(expand_home_path)
            .unwrap_or_else(resolve_config_path);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|err| {
                FleetError::invalid_params(format!(
                    "Failed to read config {}: {}",
                    path.display(),
                    err
                ))
            })?;
            Self::parse(&raw)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, FleetError> {
        let mut config: FleetConfig = serde_json::from_str(raw)
            .map_err(|err| FleetError::invalid_params(format!("Invalid config: {}", err)))?;
        config.expand_paths();
        Ok(config)
    }

    fn expand_paths(&mut self) {
        for path in [
            &mut self.private_key_path,
            &mut self.public_key_path,
            &mut self.known_hosts_path,
            &mut self.inventory_path,
            &mut self.metadata_path,
        ] {
            *path = expand_home_path(&*path);
        }
        for path in [&mut self.tls.ca, &mut self.tls.cert, &mut self.tls.key]
            .into_iter()
            .flatten()
        {
            *path = expand_home_path(&*path);
        }
    }

    fn apply_env(&mut self) -> Result<(), FleetError> {
        if let Some(value) = read_env_u64("FLEETRUN_CONCURRENCY")? {
            self.concurrency = value as usize;
        }
        if let Some(value) = read_env_u64("FLEETRUN_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = value;
        }
        if let Some(insecure) = read_env_bool("FLEETRUN_INSECURE") {
            self.verify_host_keys = !insecure;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.concurrency == 0 || self.concurrency > limits::MAX_CONCURRENCY {
            return Err(FleetError::invalid_params(format!(
                "concurrency must be between 1 and {}",
                limits::MAX_CONCURRENCY
            )));
        }
        if self.connect_timeout_ms == 0 || self.exec_timeout_ms == 0 {
            return Err(FleetError::invalid_params("timeouts must be positive"));
        }
        Ok(())
    }

    pub fn to_pretty_json(&self) -> Result<String, FleetError> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    /// Writes the default config to `path` (or the default location) unless a
    /// file is already there. Returns the path and whether it was written.
    pub fn write_default(path: Option<&Path>) -> Result<(PathBuf, bool), FleetError> {
        let path = path
            .map(expand_home_path)
            .unwrap_or_else(resolve_config_path);
        if path.exists() {
            return Ok((path, false));
        }
        let content = Self::default().to_pretty_json()?;
        atomic_write_text_file(&path, &content, 0o644)?;
        Ok((path, true))
    }

    pub fn ssh_user(&self) -> String {
        self.ssh_user
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string())
    }
}
