//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Configuration for one managed installed unit.
///
/// All durations are stored in seconds so the struct stays trivially
/// serializable; accessors convert to [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name of the installed unit (also the expected directory name)
    pub unit_name: String,
    /// File that must exist inside the installation for it to be valid,
    /// relative to the installation directory
    pub entry_point: String,
    /// Base URL of the remote release registry
    pub registry_url: String,
    /// Directory holding the live installation
    pub install_dir: PathBuf,
    /// Directory backups are written to
    pub backup_dir: PathBuf,
    /// Directory downloaded packages land in
    pub download_dir: PathBuf,
    /// Directory for engine state (lock entries, history)
    pub state_dir: PathBuf,
    /// How long a resolved release stays cached
    #[serde(default = "defaults::cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Expiry on the single-update lock entry
    #[serde(default = "defaults::lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Time budget for restoring a backup on the failure path
    #[serde(default = "defaults::restore_timeout_secs")]
    pub restore_timeout_secs: u64,
    /// Allowed relative deviation between declared and actual package size
    #[serde(default = "defaults::size_tolerance")]
    pub size_tolerance: f64,
    /// Maximum retained history entries
    #[serde(default = "defaults::history_capacity")]
    pub history_capacity: usize,
}

mod defaults {
    pub fn cache_ttl_secs() -> u64 {
        900
    }
    pub fn lock_ttl_secs() -> u64 {
        900
    }
    pub fn restore_timeout_secs() -> u64 {
        10
    }
    pub fn size_tolerance() -> f64 {
        0.05
    }
    pub fn history_capacity() -> usize {
        5
    }
}

impl EngineConfig {
    /// Create a configuration with derived state directories.
    ///
    /// Backup, download, and state directories are placed in a hidden
    /// `.upkeep` directory next to the installation.
    pub fn new<S, P, U>(unit_name: S, install_dir: P, registry_url: U) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
        U: Into<String>,
    {
        let unit_name = unit_name.into();
        let install_dir = install_dir.into();
        let state_root = install_dir
            .parent()
            .map(|p| p.join(".upkeep"))
            .unwrap_or_else(|| PathBuf::from(".upkeep"));
        Self {
            entry_point: format!("{unit_name}.toml"),
            registry_url: registry_url.into(),
            backup_dir: state_root.join("backups"),
            download_dir: state_root.join("downloads"),
            state_dir: state_root,
            unit_name,
            install_dir,
            cache_ttl_secs: defaults::cache_ttl_secs(),
            lock_ttl_secs: defaults::lock_ttl_secs(),
            restore_timeout_secs: defaults::restore_timeout_secs(),
            size_tolerance: defaults::size_tolerance(),
            history_capacity: defaults::history_capacity(),
        }
    }

    /// Load a configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| UpdateError::config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.unit_name.is_empty() {
            return Err(UpdateError::config("unit_name must not be empty"));
        }
        if self.unit_name.contains(['/', '\\']) {
            return Err(UpdateError::config("unit_name must not contain path separators"));
        }
        if self.entry_point.is_empty() {
            return Err(UpdateError::config("entry_point must not be empty"));
        }
        if self.registry_url.is_empty() {
            return Err(UpdateError::config("registry_url must not be empty"));
        }
        if !(self.size_tolerance > 0.0 && self.size_tolerance < 1.0) {
            return Err(UpdateError::config(
                "size_tolerance must be strictly between 0 and 1",
            ));
        }
        if self.history_capacity == 0 {
            return Err(UpdateError::config("history_capacity must be at least 1"));
        }
        Ok(())
    }

    /// TTL for cached release lookups
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// TTL for the single-update lock entry
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Time budget for a backup restore
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    /// Key identifying the single-update lock for this unit
    pub fn lock_key(&self) -> String {
        format!("update.{}", self.unit_name)
    }

    /// Path of the persisted history file
    pub fn history_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.history.json", self.unit_name))
    }
}
