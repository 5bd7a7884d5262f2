// src/layers/mod.rs

//! Rootfs layers and their composition
//!
//! A build's root filesystem is assembled from an ordered list of layers:
//! one base rootfs, any number of packs extracted under `chef/`, and host
//! directories that are bound in when the container starts. Linux guests
//! get a directory tree (see [`compose`]); Windows VM guests get a chain of
//! differencing disks (see [`vhdx`]).

pub mod activation;
pub mod compose;
pub mod filesystem;
pub mod rootfs;
pub mod vhdx;

pub use compose::{ComposedRootfs, LayerComposer};

use crate::error::Result;
use crate::packager::artifact::{self, Manifest};
use crate::recipe::{IngredientOptions, PackType};
use std::path::{Path, PathBuf};

/// A host path made visible inside the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    /// Guest path
    pub target: PathBuf,
    pub writable: bool,
}

impl BindMount {
    pub fn readonly(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: false,
        }
    }

    pub fn writable(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            writable: true,
        }
    }
}

/// Metadata of a pack used as a layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub publisher: String,
    pub name: String,
    pub version: String,
    pub pack_type: PackType,
    pub options: IngredientOptions,
}

impl PackageInfo {
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        Ok(Self {
            publisher: manifest.publisher.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            pack_type: manifest.pack_type()?,
            options: manifest.options.clone().unwrap_or_default(),
        })
    }

    /// Read the manifest of the pack at `path`
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_manifest(&artifact::read_manifest(path)?)
    }

    pub fn is_application(&self) -> bool {
        self.pack_type == PackType::Application
    }

    /// Extraction directory relative to the rootfs
    pub fn install_dir(&self) -> PathBuf {
        if self.is_application() {
            Path::new("chef/app").join(&self.publisher).join(&self.name)
        } else {
            Path::new("chef/pkgs")
                .join(&self.publisher)
                .join(&self.name)
                .join(&self.version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    /// A directory tree or a `.vhdx` disk
    BaseRootfs { source: PathBuf },
    /// A pack extracted into the chef tree
    VafsPackage { path: PathBuf, package: PackageInfo },
    HostDirectory {
        host: PathBuf,
        guest: PathBuf,
        readonly: bool,
    },
}

impl Layer {
    /// Load a pack layer, reading its manifest
    pub fn package(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let package = PackageInfo::load(&path)?;
        Ok(Layer::VafsPackage { path, package })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Layer::BaseRootfs { .. } => "base",
            Layer::VafsPackage { .. } => "package",
            Layer::HostDirectory { .. } => "host",
        }
    }

    /// The mount a host-directory layer turns into
    pub fn bind_mount(&self) -> Option<BindMount> {
        match self {
            Layer::HostDirectory {
                host,
                guest,
                readonly,
            } => Some(BindMount {
                source: host.clone(),
                target: guest.clone(),
                writable: !readonly,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pack_type: PackType) -> PackageInfo {
        PackageInfo {
            publisher: "acme".to_string(),
            name: "zlib".to_string(),
            version: "1.3.1".to_string(),
            pack_type,
            options: IngredientOptions::default(),
        }
    }

    #[test]
    fn test_install_dir() {
        assert_eq!(
            info(PackType::Ingredient).install_dir(),
            PathBuf::from("chef/pkgs/acme/zlib/1.3.1")
        );
        assert_eq!(
            info(PackType::Application).install_dir(),
            PathBuf::from("chef/app/acme/zlib")
        );
    }

    #[test]
    fn test_bind_mount_from_layer() {
        let layer = Layer::HostDirectory {
            host: PathBuf::from("/home/me/src"),
            guest: PathBuf::from("/chef/project"),
            readonly: true,
        };
        assert_eq!(
            layer.bind_mount(),
            Some(BindMount::readonly("/home/me/src", "/chef/project"))
        );
        let base = Layer::BaseRootfs {
            source: PathBuf::from("/srv/base"),
        };
        assert_eq!(base.bind_mount(), None);
        assert_eq!(base.kind(), "base");
    }
}
