// src/cache.rs

//! Per-step completion state for the kitchen
//!
//! The cache records which steps of which parts completed successfully,
//! the host package set last installed into the rootfs, and a handful of
//! named keys (for example `setup_rootfs`). It is persisted as JSON next to
//! the kitchen state and rewritten atomically on every commit.
//!
//! A project fingerprint is stored alongside. It covers the normalized
//! project name, the sorted ingredient names and the build target; when it
//! differs from the stored one on load, all progress is discarded.

use crate::error::{Error, Result};
use crate::hash::Fnv1a;
use crate::recipe::{Recipe, Target};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Cache key set once the host packages have been bootstrapped into the rootfs
pub const SETUP_ROOTFS_KEY: &str = "setup_rootfs";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    parts: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    keys: BTreeSet<String>,
}

/// Result of diffing the declared host packages against the committed set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PackageChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Durable build progress for one recipe
#[derive(Debug)]
pub struct BuildCache {
    path: PathBuf,
    state: CacheState,
    /// part -> step -> depends
    graph: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    declared_packages: Vec<String>,
    transaction_depth: usize,
    dirty: bool,
}

/// Compute the project fingerprint for a recipe and target
pub fn fingerprint(recipe: &Recipe, target: &Target) -> String {
    let mut state = Fnv1a::new();
    state.update_field(&recipe.project.name.trim().to_lowercase());

    let names: BTreeSet<&str> = recipe.ingredients().map(|i| i.name.as_str()).collect();
    for name in names {
        state.update_field(name);
    }

    state.update_field(&target.platform);
    state.update_field(&target.arch);
    format!("{:016x}", state.finish())
}

impl BuildCache {
    /// Load (or create) the cache file at `path` for the given recipe
    pub fn open(path: impl Into<PathBuf>, recipe: &Recipe, target: &Target) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::StateInconsistent(format!(
                    "build cache {} is corrupt: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            CacheState::default()
        };

        let graph = recipe
            .parts
            .iter()
            .map(|part| {
                let steps = part
                    .steps
                    .iter()
                    .map(|s| (s.name.clone(), s.depends.clone()))
                    .collect();
                (part.name.clone(), steps)
            })
            .collect();

        let mut cache = Self {
            path,
            state,
            graph,
            declared_packages: recipe.environment.host.packages.clone(),
            transaction_depth: 0,
            dirty: false,
        };

        let current = fingerprint(recipe, target);
        match cache.state.fingerprint.as_deref() {
            Some(stored) if stored == current => {
                debug!("Build cache fingerprint {} matches", current);
            }
            Some(stored) => {
                info!(
                    "Recipe fingerprint changed ({} -> {}), discarding build progress",
                    stored, current
                );
                cache.state = CacheState::default();
                cache.state.fingerprint = Some(current);
                cache.dirty = true;
                cache.save()?;
            }
            None => {
                cache.state.fingerprint = Some(current);
                cache.dirty = true;
                cache.save()?;
            }
        }

        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.state.fingerprint.as_deref()
    }

    pub fn is_step_complete(&self, part: &str, step: &str) -> bool {
        self.state
            .parts
            .get(part)
            .is_some_and(|steps| steps.contains(step))
    }

    pub fn mark_step_complete(&mut self, part: &str, step: &str) -> Result<()> {
        let inserted = self
            .state
            .parts
            .entry(part.to_string())
            .or_default()
            .insert(step.to_string());
        if inserted {
            debug!("Marked {}/{} complete", part, step);
            self.touch()?;
        }
        Ok(())
    }

    /// Mark a step incomplete along with every step that transitively
    /// depends on it
    pub fn mark_step_incomplete(&mut self, part: &str, step: &str) -> Result<()> {
        let mut invalid = BTreeSet::new();
        invalid.insert(step.to_string());

        if let Some(steps) = self.graph.get(part) {
            let mut pending = vec![step.to_string()];
            while let Some(current) = pending.pop() {
                for (name, depends) in steps {
                    if depends.iter().any(|d| *d == current) && invalid.insert(name.clone()) {
                        pending.push(name.clone());
                    }
                }
            }
        }

        let mut changed = false;
        if let Some(done) = self.state.parts.get_mut(part) {
            for name in &invalid {
                changed |= done.remove(name);
            }
        }
        if changed {
            debug!("Invalidated {}: {:?}", part, invalid);
            self.touch()?;
        }
        Ok(())
    }

    /// Mark every step of a part incomplete
    pub fn mark_part_incomplete(&mut self, part: &str) -> Result<()> {
        if self.state.parts.remove(part).is_some() {
            self.touch()?;
        }
        Ok(())
    }

    /// Drop all step completion and named keys
    pub fn invalidate_all(&mut self) -> Result<()> {
        self.state.parts.clear();
        self.state.keys.clear();
        self.touch()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.state.keys.contains(key)
    }

    pub fn set_key(&mut self, key: &str, value: bool) -> Result<()> {
        let changed = if value {
            self.state.keys.insert(key.to_string())
        } else {
            self.state.keys.remove(key)
        };
        if changed {
            self.touch()?;
        }
        Ok(())
    }

    /// Diff the declared host packages against the last committed set
    pub fn calculate_package_changes(&self) -> PackageChanges {
        let previous: BTreeSet<&str> = self.state.packages.iter().map(String::as_str).collect();
        let declared: BTreeSet<&str> = self.declared_packages.iter().map(String::as_str).collect();

        PackageChanges {
            added: declared
                .difference(&previous)
                .map(|s| s.to_string())
                .collect(),
            removed: previous
                .difference(&declared)
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn commit_package_changes(&mut self, packages: &[String]) -> Result<()> {
        let mut packages = packages.to_vec();
        packages.sort();
        packages.dedup();
        self.state.packages = packages;
        self.touch()
    }

    /// Start batching mutations; nothing is written until the matching
    /// `transaction_commit`
    pub fn transaction_begin(&mut self) {
        self.transaction_depth += 1;
    }

    pub fn transaction_commit(&mut self) -> Result<()> {
        if self.transaction_depth == 0 {
            return Err(Error::StateInconsistent(
                "build cache commit without a matching begin".to_string(),
            ));
        }
        self.transaction_depth -= 1;
        if self.transaction_depth == 0 {
            self.save()?;
        }
        Ok(())
    }

    fn touch(&mut self) -> Result<()> {
        self.dirty = true;
        if self.transaction_depth == 0 {
            self.save()?;
        }
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_vec_pretty(&self.state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::parse;
    use tempfile::TempDir;

    const RECIPE: &str = r#"
project:
  name: Demo
  summary: s
  version: 1.0.0
  author: a
  email: a@b.c
environment:
  host:
    packages: [make, gcc]
  build:
    ingredients:
      - name: vali/zlib
        channel: stable
recipes:
  - name: app
    steps:
      - name: gen
        type: generate
        system: cmake
      - name: compile
        type: build
        system: make
        depends: [gen]
      - name: extra
        type: script
        script: echo
        depends: [compile]
      - name: other
        type: script
        script: echo
"#;

    fn target(arch: &str) -> Target {
        Target {
            platform: "linux".to_string(),
            arch: arch.to_string(),
        }
    }

    fn open(dir: &TempDir) -> BuildCache {
        let recipe = parse(RECIPE).unwrap();
        BuildCache::open(dir.path().join("cache.json"), &recipe, &target("amd64")).unwrap()
    }

    #[test]
    fn test_fingerprint_depends_on_target_and_ingredients() {
        let recipe = parse(RECIPE).unwrap();
        let a = fingerprint(&recipe, &target("amd64"));
        assert_eq!(a, fingerprint(&recipe, &target("amd64")));
        assert_ne!(a, fingerprint(&recipe, &target("arm64")));

        let mut renamed = recipe.clone();
        renamed.project.name = " demo ".to_string();
        assert_eq!(a, fingerprint(&renamed, &target("amd64")));

        let mut more = recipe.clone();
        more.environment.runtime.ingredients.push(crate::recipe::Ingredient {
            name: "vali/ssl".to_string(),
            channel: "stable".to_string(),
            ..Default::default()
        });
        assert_ne!(a, fingerprint(&more, &target("amd64")));
    }

    #[test]
    fn test_mark_incomplete_invalidates_dependents() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        for step in ["gen", "compile", "extra", "other"] {
            cache.mark_step_complete("app", step).unwrap();
        }

        cache.mark_step_incomplete("app", "gen").unwrap();
        assert!(!cache.is_step_complete("app", "gen"));
        assert!(!cache.is_step_complete("app", "compile"));
        assert!(!cache.is_step_complete("app", "extra"));
        assert!(cache.is_step_complete("app", "other"));
    }

    #[test]
    fn test_state_persists_across_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut cache = open(&dir);
            cache.mark_step_complete("app", "gen").unwrap();
            cache.set_key(SETUP_ROOTFS_KEY, true).unwrap();
        }
        let cache = open(&dir);
        assert!(cache.is_step_complete("app", "gen"));
        assert!(cache.has_key(SETUP_ROOTFS_KEY));
    }

    #[test]
    fn test_fingerprint_mismatch_discards_progress() {
        let dir = TempDir::new().unwrap();
        let recipe = parse(RECIPE).unwrap();
        let path = dir.path().join("cache.json");
        {
            let mut cache = BuildCache::open(&path, &recipe, &target("amd64")).unwrap();
            cache.mark_step_complete("app", "gen").unwrap();
        }
        let cache = BuildCache::open(&path, &recipe, &target("arm64")).unwrap();
        assert!(!cache.is_step_complete("app", "gen"));
    }

    #[test]
    fn test_transaction_defers_write() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        let before = fs::read_to_string(cache.path()).unwrap();

        cache.transaction_begin();
        cache.mark_step_complete("app", "gen").unwrap();
        assert_eq!(fs::read_to_string(cache.path()).unwrap(), before);
        cache.transaction_commit().unwrap();

        assert_ne!(fs::read_to_string(cache.path()).unwrap(), before);
        assert!(cache.transaction_commit().is_err());
    }

    #[test]
    fn test_package_changes() {
        let dir = TempDir::new().unwrap();
        let mut cache = open(&dir);
        let changes = cache.calculate_package_changes();
        assert_eq!(changes.added, vec!["gcc", "make"]);
        assert!(changes.removed.is_empty());

        cache
            .commit_package_changes(&["make".to_string(), "cmake".to_string()])
            .unwrap();
        let changes = cache.calculate_package_changes();
        assert_eq!(changes.added, vec!["gcc"]);
        assert_eq!(changes.removed, vec!["cmake"]);
    }
}
