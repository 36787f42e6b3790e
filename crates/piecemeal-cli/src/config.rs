use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest a drop stays claimable: one week.
pub const MAX_CLAIM_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub data_path: PathBuf,
    pub asset_root: PathBuf,
    pub tick_interval_secs: u64,
    pub claim_ttl_secs: u64,
    /// Tee target for logs. `{pid}` expands to the process id.
    pub log_file: Option<PathBuf>,
    pub render_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("piecemeal.json"),
            asset_root: PathBuf::from("."),
            tick_interval_secs: 30,
            claim_ttl_secs: 300,
            log_file: None,
            render_dir: PathBuf::from("renders"),
        }
    }
}

impl Settings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        let raw = self.log_file.as_ref()?.to_str()?;
        if raw.trim().is_empty() {
            return None;
        }
        Some(PathBuf::from(raw.replace("{pid}", &std::process::id().to_string())))
    }

    /// Clamped to `1..=MAX_CLAIM_TTL_SECS`.
    pub fn claim_ttl(&self) -> chrono::Duration {
        let secs = self.claim_ttl_secs.clamp(1, MAX_CLAIM_TTL_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(1))
    }
}

/// A missing file means defaults; an unparsable one is an error.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path.display()))
}

pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var("PIECEMEAL_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    config_dir().join("piecemeal/config.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
