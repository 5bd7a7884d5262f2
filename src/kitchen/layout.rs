// src/kitchen/layout.rs

//! On-disk kitchen layout
//!
//! ```text
//! ~/.chef/kitchen/
//!   index.json                  canonical recipe path -> uuid
//!   <uuid>/<recipe>/
//!     build.log
//!     build-cache.json
//!     ns/                       container rootfs
//!       chef/{project,install,toolchains,ingredients,build,data,.hash}
//!     output/                   packs
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const INDEX_FILE: &str = "index.json";
pub const HASH_FILE: &str = ".hash";
pub const LOG_FILE: &str = "build.log";
pub const CACHE_FILE: &str = "build-cache.json";

/// Subdirectories of `chef/` created for every kitchen
pub const CHEF_DIRS: &[&str] = &[
    "project",
    "install",
    "toolchains",
    "ingredients",
    "build",
    "data",
];

/// Maps canonical recipe paths to their kitchen uuid
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KitchenIndex {
    #[serde(default)]
    recipes: BTreeMap<String, String>,
}

impl KitchenIndex {
    pub fn load(kitchen_dir: &Path) -> Result<Self> {
        let path = kitchen_dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            Error::StateInconsistent(format!("kitchen index {} is corrupt: {}", path.display(), e))
        })
    }

    pub fn save(&self, kitchen_dir: &Path) -> Result<()> {
        fs::create_dir_all(kitchen_dir)?;
        let mut file = tempfile::NamedTempFile::new_in(kitchen_dir)?;
        file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        file.persist(kitchen_dir.join(INDEX_FILE))
            .map_err(|e| Error::IoError(format!("write kitchen index: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, recipe_path: &str) -> Option<&str> {
        self.recipes.get(recipe_path).map(String::as_str)
    }

    /// The uuid for `recipe_path`, allocating one on first use
    pub fn uuid_for(&mut self, recipe_path: &str) -> (String, bool) {
        if let Some(uuid) = self.recipes.get(recipe_path) {
            return (uuid.clone(), false);
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        self.recipes.insert(recipe_path.to_string(), uuid.clone());
        (uuid, true)
    }
}

/// Canonical form of a recipe path used as the index key
pub fn canonical_recipe_path(path: &Path) -> Result<String> {
    let canonical = fs::canonicalize(path)
        .map_err(|e| Error::NotFound(format!("recipe {}: {}", path.display(), e)))?;
    Ok(canonical.to_string_lossy().into_owned())
}

/// Paths of one recipe's kitchen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KitchenLayout {
    pub uuid: String,
    /// `<kitchen>/<uuid>/<recipe>`
    pub root: PathBuf,
}

impl KitchenLayout {
    /// Look up (or allocate) the kitchen of the recipe at `recipe_path`
    pub fn resolve(kitchen_dir: &Path, recipe_path: &Path, recipe_name: &str) -> Result<Self> {
        let key = canonical_recipe_path(recipe_path)?;
        let mut index = KitchenIndex::load(kitchen_dir)?;
        let (uuid, created) = index.uuid_for(&key);
        if created {
            index.save(kitchen_dir)?;
            info!("Allocated kitchen {} for {}", uuid, key);
        }
        Ok(Self::new(kitchen_dir, uuid, recipe_name))
    }

    pub fn new(kitchen_dir: &Path, uuid: impl Into<String>, recipe_name: &str) -> Self {
        let uuid = uuid.into();
        let root = kitchen_dir.join(&uuid).join(recipe_name);
        Self { uuid, root }
    }

    /// Rootfs staging directory
    pub fn ns(&self) -> PathBuf {
        self.root.join("ns")
    }

    pub fn chef(&self) -> PathBuf {
        self.ns().join("chef")
    }

    pub fn project(&self) -> PathBuf {
        self.chef().join("project")
    }

    pub fn install(&self) -> PathBuf {
        self.chef().join("install")
    }

    pub fn toolchains(&self) -> PathBuf {
        self.chef().join("toolchains")
    }

    pub fn ingredients(&self) -> PathBuf {
        self.chef().join("ingredients")
    }

    pub fn build(&self) -> PathBuf {
        self.chef().join("build")
    }

    pub fn data(&self) -> PathBuf {
        self.chef().join("data")
    }

    pub fn hash_file(&self) -> PathBuf {
        self.chef().join(HASH_FILE)
    }

    pub fn output(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }

    /// Fingerprint recorded by the last `setup`
    pub fn stored_fingerprint(&self) -> Option<String> {
        fs::read_to_string(self.hash_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Create the tree and record the project fingerprint
    pub fn setup(&self, fingerprint: &str) -> Result<()> {
        for dir in CHEF_DIRS {
            fs::create_dir_all(self.chef().join(dir))?;
        }
        fs::create_dir_all(self.output())?;

        if self.stored_fingerprint().as_deref() != Some(fingerprint) {
            fs::write(self.hash_file(), format!("{}\n", fingerprint))?;
            debug!("Kitchen {} fingerprint {}", self.uuid, fingerprint);
        }
        Ok(())
    }

    /// Start a fresh build log
    pub fn reset_log(&self) -> Result<PathBuf> {
        let path = self.log_file();
        fs::create_dir_all(&self.root)?;
        fs::write(&path, "")?;
        Ok(path)
    }
}

/// Delete every kitchen; returns whether anything was removed
pub fn purge(kitchen_dir: &Path) -> Result<bool> {
    if !kitchen_dir.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(kitchen_dir)?;
    info!("Purged {}", kitchen_dir.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_uuid_is_stable_per_recipe() {
        let dir = TempDir::new().unwrap();
        let recipe = dir.path().join("recipe.yaml");
        fs::write(&recipe, "").unwrap();
        let kitchen = dir.path().join("kitchen");

        let first = KitchenLayout::resolve(&kitchen, &recipe, "zlib").unwrap();
        let second = KitchenLayout::resolve(&kitchen, &recipe, "zlib").unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first.uuid).is_ok());
        assert!(kitchen.join(INDEX_FILE).exists());

        let other = dir.path().join("other.yaml");
        fs::write(&other, "").unwrap();
        let third = KitchenLayout::resolve(&kitchen, &other, "zlib").unwrap();
        assert_ne!(first.uuid, third.uuid);
    }

    #[test]
    fn test_missing_recipe_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = KitchenLayout::resolve(dir.path(), &dir.path().join("nope.yaml"), "x").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_setup_creates_tree_and_hash() {
        let dir = TempDir::new().unwrap();
        let layout = KitchenLayout::new(dir.path(), "1234", "zlib");
        layout.setup("00ff").unwrap();
        for sub in CHEF_DIRS {
            assert!(layout.chef().join(sub).is_dir(), "{}", sub);
        }
        assert!(layout.output().is_dir());
        assert_eq!(layout.stored_fingerprint().as_deref(), Some("00ff"));
        assert_eq!(layout.root, dir.path().join("1234/zlib"));

        layout.setup("abcd").unwrap();
        assert_eq!(layout.stored_fingerprint().as_deref(), Some("abcd"));
    }

    #[test]
    fn test_purge() {
        let dir = TempDir::new().unwrap();
        let kitchen = dir.path().join("kitchen");
        KitchenLayout::new(&kitchen, "u", "r").setup("f").unwrap();
        assert!(purge(&kitchen).unwrap());
        assert!(!kitchen.exists());
        assert!(!purge(&kitchen).unwrap());
    }
}
