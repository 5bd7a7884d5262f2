// src/config.rs

//! User configuration for bake
//!
//! Read from `~/.chef/bake.toml` when present; every key is optional:
//!
//! ```toml
//! kitchen_dir = "/var/tmp/kitchen"
//! ingredient_sources = ["https://packs.example.org", "/srv/packs"]
//! remote_url = "https://build.example.org"
//! confined = true
//! memory_max = "4G"
//! cpu_percent = 50
//! process_count = 512
//! allow_network = false
//! timeout_secs = 3600
//! ```

use crate::container::ResourceLimits;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE: &str = "bake.toml";

/// Home directory, taken from `HOME` first
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `~/.chef`, the root of all per-user state
pub fn chef_dir() -> PathBuf {
    home_dir().join(".chef")
}

/// Name of the invoking user
pub fn user() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "chef".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kitchen_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_db: Option<PathBuf>,
    /// Ingredient repositories, URLs or directories, tried in order
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ingredient_sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    pub confined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_max: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_count: Option<u64>,
    pub allow_network: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<PathBuf>,
    /// Per-step timeout; unset waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            kitchen_dir: None,
            store_dir: None,
            state_db: None,
            ingredient_sources: Vec::new(),
            remote_url: None,
            confined: true,
            memory_max: None,
            cpu_percent: None,
            process_count: None,
            allow_network: false,
            signing_key: None,
            timeout_secs: None,
        }
    }
}

impl BakeConfig {
    pub fn config_path() -> PathBuf {
        chef_dir().join(CONFIG_FILE)
    }

    /// Load the user config, falling back to defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            Error::validation(format!("config {}", path.display()), e.to_string())
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::IoError(format!("encode config: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    pub fn kitchen_dir(&self) -> PathBuf {
        self.kitchen_dir
            .clone()
            .unwrap_or_else(|| chef_dir().join("kitchen"))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| chef_dir().join("store"))
    }

    pub fn state_db(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| chef_dir().join("state.db"))
    }

    pub fn signing_key(&self) -> PathBuf {
        self.signing_key
            .clone()
            .unwrap_or_else(|| chef_dir().join("signing.key"))
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn limits(&self) -> Result<ResourceLimits> {
        let cpu = self.cpu_percent.map(|c| c.to_string());
        let pids = self.process_count.map(|p| p.to_string());
        ResourceLimits::parse(self.memory_max.as_deref(), cpu.as_deref(), pids.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BakeConfig::default();
        assert!(config.confined);
        assert!(!config.allow_network);
        assert!(config.kitchen_dir().ends_with(".chef/kitchen"));
        assert!(config.limits().unwrap().is_unlimited());
        assert!(config.step_timeout().is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = BakeConfig::load_from(&dir.path().join("bake.toml")).unwrap();
        assert_eq!(config, BakeConfig::default());
    }

    #[test]
    fn test_parse_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bake.toml");
        fs::write(
            &path,
            "confined = false\nmemory_max = \"2G\"\ncpu_percent = 50\ningredient_sources = [\"/srv/packs\"]\n",
        )
        .unwrap();
        let config = BakeConfig::load_from(&path).unwrap();
        assert!(!config.confined);
        assert_eq!(config.ingredient_sources, vec!["/srv/packs".to_string()]);
        let limits = config.limits().unwrap();
        assert_eq!(limits.memory_max, Some(2 * 1024 * 1024 * 1024));
        assert_eq!(limits.cpu_percent, Some(50));
    }

    #[test]
    fn test_unknown_value_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bake.toml");
        fs::write(&path, "confined = \"maybe\"\n").unwrap();
        assert!(BakeConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/bake.toml");
        let config = BakeConfig {
            remote_url: Some("https://build.example.org".to_string()),
            timeout_secs: Some(60),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(BakeConfig::load_from(&path).unwrap(), config);
    }
}
