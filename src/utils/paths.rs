use std::env;
use std::path::{Path, PathBuf};

fn normalize_env_path(value: Option<String>) -> Option<PathBuf> {
    let raw = value?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if lowered == "undefined" || lowered == "null" {
        return None;
    }
    Some(expand_home_path(trimmed))
}

fn resolve_home_dir() -> Option<PathBuf> {
    env::var("HOME").ok().map(PathBuf::from)
}

fn resolve_xdg_state_dir() -> Option<PathBuf> {
    if let Some(path) = normalize_env_path(env::var("XDG_STATE_HOME").ok()) {
        return Some(path);
    }
    resolve_home_dir().map(|home| home.join(".local").join("state"))
}

pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if let Some(str_path) = path.to_str() {
        if let Some(rest) = str_path.strip_prefix("~/") {
            if let Some(home) = resolve_home_dir() {
                return home.join(rest);
            }
        }
        if str_path == "~" {
            if let Some(home) = resolve_home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

pub fn resolve_state_dir() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETRUN_HOME").ok()) {
        return path;
    }
    if let Some(path) = resolve_xdg_state_dir() {
        return path.join("fleetrun");
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".fleetrun")
}

pub fn resolve_config_path() -> PathBuf {
    if let Some(path) = normalize_env_path(env::var("FLEETRUN_CONFIG").ok()) {
        return path;
    }
    resolve_state_dir().join("config.json")
}

pub fn resolve_known_hosts_path() -> PathBuf {
    resolve_state_dir().join("known_hosts")
}

pub fn resolve_inventory_path() -> PathBuf {
    resolve_state_dir().join("inventory.json")
}

pub fn resolve_metadata_path() -> PathBuf {
    resolve_state_dir().join("metadata.json")
}

pub fn resolve_private_key_path() -> PathBuf {
    resolve_state_dir().join("id_ed25519")
}

pub fn resolve_public_key_path() -> PathBuf {
    resolve_state_dir().join("id_ed25519.pub")
}
