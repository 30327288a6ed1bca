//! `offsync.json` loading.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use offsync_remote::RestConfig;
use offsync_storage::StoreConfig;
use offsync_sync::SyncConfig;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "offsync.json";

/// Settings of the diagnostics tool.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store: StoreConfig,
    /// Backend used by `sync` and `resolve`.
    pub remote: Option<RestConfig>,
    pub sync: SyncConfig,
}

impl CliConfig {
    /// Load `path`, or `offsync.json` if present, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Database file: the configured path, else the per-user data directory.
    pub fn database_path(&self, overridden: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = overridden.or(self.store.path.as_deref()) {
            return Ok(path.to_path_buf());
        }
        let dir = dirs::data_dir().context("No data directory on this platform")?;
        Ok(dir.join("offsync").join("offline.db"))
    }
}
