// src/packager/mod.rs

//! Packs produced from the install tree
//!
//! After every part has been built, each pack declared by the recipe is
//! emitted in declaration order from `<kitchen>/ns/chef/install`. Application
//! packs carry their commands; every other type carries ingredient options
//! for downstream consumers.

pub mod artifact;
pub mod filter;
pub mod signing;

pub use artifact::{FileEntry, Manifest};
pub use filter::PathFilter;
pub use signing::{PackSignature, SigningKeyPair};

use crate::error::{Error, Result};
use crate::recipe::{Pack, PackType, Recipe, Target};
use std::path::{Path, PathBuf};
use tracing::info;

/// Publisher name derived from the recipe author
pub fn publisher_name(author: &str) -> String {
    let mut out = String::new();
    for c in author.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "local".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct Packager<'a> {
    recipe: &'a Recipe,
    target: &'a Target,
    publisher: String,
    key: Option<&'a SigningKeyPair>,
}

impl<'a> Packager<'a> {
    pub fn new(recipe: &'a Recipe, target: &'a Target) -> Self {
        Self {
            recipe,
            target,
            publisher: publisher_name(&recipe.project.author),
            key: None,
        }
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = publisher.into();
        self
    }

    pub fn with_signing_key(mut self, key: &'a SigningKeyPair) -> Self {
        self.key = Some(key);
        self
    }

    fn manifest(&self, pack: &Pack) -> Manifest {
        let is_app = pack.pack_type == PackType::Application;
        Manifest {
            name: pack.name.clone(),
            publisher: self.publisher.clone(),
            version: self.recipe.project.version.clone(),
            pack_type: pack.pack_type.as_str().to_string(),
            platform: self.target.platform.clone(),
            arch: self.target.arch.clone(),
            options: (!is_app).then(|| pack.options.clone()),
            commands: if is_app { pack.commands.clone() } else { Vec::new() },
            files: Vec::new(),
        }
    }

    /// Emit one pack; returns its path
    pub fn pack(&self, pack: &Pack, install_root: &Path, out_dir: &Path) -> Result<PathBuf> {
        if !pack.commands.is_empty() && pack.pack_type != PackType::Application {
            return Err(Error::validation(
                format!("pack '{}'", pack.name),
                "commands are only allowed on application packs",
            ));
        }
        let filter = PathFilter::new(&pack.filters)?;
        let path = artifact::write_pack(install_root, &filter, self.manifest(pack), out_dir, self.key)?;
        info!("Packed {} -> {}", pack.name, path.display());
        Ok(path)
    }

    /// Emit every declared pack in order
    pub fn pack_all(&self, install_root: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        if !install_root.is_dir() {
            return Err(Error::NotFound(format!(
                "install tree {}",
                install_root.display()
            )));
        }
        self.recipe
            .packs
            .iter()
            .map(|pack| self.pack(pack, install_root, out_dir))
            .collect()
    }
}
