// src/layers/compose.rs

//! Rootfs composition for directory-backed guests
//!
//! [`LayerComposer::compose`] turns an ordered layer list into a staged
//! rootfs tree:
//!
//! 1. the base rootfs is snapshotted into the staging directory and host
//!    packages are bootstrapped into it (skipped while the build cache
//!    holds the `setup_rootfs` key and the package set is unchanged)
//! 2. packs are extracted under `chef/` in declaration order, each with a
//!    `current` link to the newest extraction; if one fails, every pack
//!    extracted by the same pass is removed again
//! 3. the activation script is written
//! 4. host directories become bind mounts for the container
//!
//! Windows VM guests keep their `.vhdx` base; the runtime turns it into a
//! disk chain with [`crate::layers::vhdx::prepare_layers`].

use crate::cache::{BuildCache, SETUP_ROOTFS_KEY};
use crate::error::{Error, Result};
use crate::layers::activation::{self, GuestStyle};
use crate::layers::filesystem::DirectoryFilesystem;
use crate::layers::rootfs::{self, Bootstrap, NoBootstrap};
use crate::layers::{BindMount, Layer, PackageInfo};
use crate::packager::artifact;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of composing a layer list
#[derive(Debug, Clone)]
pub struct ComposedRootfs {
    pub root: PathBuf,
    /// Packs extracted into the tree, in declaration order
    pub packages: Vec<PackageInfo>,
    pub mounts: Vec<BindMount>,
    /// Host path of the activation script
    pub activation: PathBuf,
    /// Whether the base rootfs was (re)staged during this compose
    pub rootfs_prepared: bool,
}

pub struct LayerComposer {
    staging: PathBuf,
    bootstrap: Box<dyn Bootstrap>,
    host_packages: Vec<String>,
    style: GuestStyle,
}

impl LayerComposer {
    pub fn new(staging: impl Into<PathBuf>) -> Self {
        Self {
            staging: staging.into(),
            bootstrap: Box::new(NoBootstrap),
            host_packages: Vec::new(),
            style: GuestStyle::Posix,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Box<dyn Bootstrap>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Host packages the rootfs must contain
    pub fn with_host_packages(mut self, packages: Vec<String>) -> Self {
        self.host_packages = packages;
        self
    }

    pub fn with_style(mut self, style: GuestStyle) -> Self {
        self.style = style;
        self
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    pub fn compose(&self, layers: &[Layer], cache: &mut BuildCache) -> Result<ComposedRootfs> {
        fs::create_dir_all(&self.staging)?;

        let mut bases = layers.iter().filter_map(|l| match l {
            Layer::BaseRootfs { source } => Some(source.as_path()),
            _ => None,
        });
        let base = bases.next();
        if bases.next().is_some() {
            return Err(Error::validation("layers", "more than one base rootfs layer"));
        }

        let rootfs_prepared = self.setup_rootfs(base, cache)?;

        let mut packages = Vec::new();
        for layer in layers {
            if let Layer::VafsPackage { path, package } = layer {
                if let Err(e) = self.extract_package(path, package) {
                    self.roll_back(&packages);
                    return Err(e);
                }
                packages.push(package.clone());
            }
        }

        let activation = activation::write(&self.staging, &packages, self.style)?;
        let mounts = layers.iter().filter_map(Layer::bind_mount).collect();

        info!(
            "Composed rootfs at {} ({} pack(s))",
            self.staging.display(),
            packages.len()
        );
        Ok(ComposedRootfs {
            root: self.staging.clone(),
            packages,
            mounts,
            activation,
            rootfs_prepared,
        })
    }

    /// Stage the base and host packages; returns whether anything was done
    fn setup_rootfs(&self, base: Option<&Path>, cache: &mut BuildCache) -> Result<bool> {
        if let Some(source) = base {
            if is_disk(source) && self.style == GuestStyle::Posix {
                return Err(Error::validation(
                    "layers",
                    format!("{} is a disk image; Linux guests need a directory", source.display()),
                ));
            }
        }

        if cache.has_key(SETUP_ROOTFS_KEY) {
            let changes = cache.calculate_package_changes();
            if changes.is_empty() {
                debug!("Rootfs already set up");
                return Ok(false);
            }
            if !changes.removed.is_empty() {
                warn!(
                    "Host packages no longer declared stay installed until clean: {}",
                    changes.removed.join(", ")
                );
            }
            cache.transaction_begin();
            let result = self
                .bootstrap
                .install(&self.staging, &changes.added)
                .and_then(|_| cache.commit_package_changes(&self.host_packages));
            cache.transaction_commit()?;
            result?;
            return Ok(true);
        }

        if let Some(source) = base.filter(|s| !is_disk(s)) {
            info!("Staging base rootfs {}", source.display());
            rootfs::snapshot(source, &self.staging)?;
        }
        if !self.host_packages.is_empty() {
            info!(
                "Bootstrapping host packages with {}",
                self.bootstrap.name()
            );
        }
        self.bootstrap.install(&self.staging, &self.host_packages)?;

        cache.transaction_begin();
        let result = cache
            .commit_package_changes(&self.host_packages)
            .and_then(|_| cache.set_key(SETUP_ROOTFS_KEY, true));
        cache.transaction_commit()?;
        result?;
        Ok(true)
    }

    /// Extract one pack next to its final location, then move it in place
    fn extract_package(&self, pack: &Path, package: &PackageInfo) -> Result<()> {
        let dest = self.staging.join(package.install_dir());
        let parent = dest
            .parent()
            .ok_or_else(|| Error::IoError(format!("invalid install dir {}", dest.display())))?;
        fs::create_dir_all(parent)?;

        let temp = self
            .staging
            .join(format!(".compose-{}", uuid::Uuid::new_v4().simple()));
        let extracted = DirectoryFilesystem::new(&temp).and_then(|mut target| {
            artifact::unpack_into(pack, &mut target, &[])
        });
        if let Err(e) = extracted {
            let _ = fs::remove_dir_all(&temp);
            return Err(e);
        }

        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(&temp, &dest)?;
        link_current(package)
            .map(|(at, to)| replace_link(&self.staging.join(at), &to))
            .transpose()?;

        debug!(
            "Extracted {}/{} {} into {}",
            package.publisher,
            package.name,
            package.version,
            dest.display()
        );
        Ok(())
    }

    /// Remove the packs a failed compose pass already extracted
    fn roll_back(&self, packages: &[PackageInfo]) {
        for package in packages {
            let dest = self.staging.join(package.install_dir());
            if let Err(e) = fs::remove_dir_all(&dest) {
                warn!("Failed to remove {}: {}", dest.display(), e);
            }
            if let Some((at, _)) = link_current(package) {
                let at = self.staging.join(at);
                if at.symlink_metadata().is_ok() {
                    let _ = fs::remove_file(&at);
                }
            }
        }
        if !packages.is_empty() {
            warn!("Rolled back {} extracted pack(s)", packages.len());
        }
    }
}

fn is_disk(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("vhdx"))
}

/// The `current` link for a package: where it lives and what it points to
fn link_current(package: &PackageInfo) -> Option<(PathBuf, PathBuf)> {
    if package.is_application() {
        Some((
            PathBuf::from("chef/app/current"),
            Path::new(&package.publisher).join(&package.name),
        ))
    } else {
        let dir = package.install_dir();
        let parent = dir.parent()?.to_path_buf();
        Some((parent.join("current"), PathBuf::from(&package.version)))
    }
}

fn replace_link(at: &Path, to: &Path) -> Result<()> {
    if at.symlink_metadata().is_ok() {
        if at.is_dir() && !at.symlink_metadata()?.file_type().is_symlink() {
            fs::remove_dir_all(at)?;
        } else {
            fs::remove_file(at)?;
        }
    }
    rootfs::make_symlink(to, at)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::packager::artifact::tests::write_test_pack;
    use crate::recipe::{IngredientOptions, PackType, Recipe, Target};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingBootstrap {
        installs: Mutex<Vec<Vec<String>>>,
    }

    impl Bootstrap for Arc<RecordingBootstrap> {
        fn name(&self) -> &str {
            "recording"
        }

        fn install(&self, root: &Path, packages: &[String]) -> Result<()> {
            fs::create_dir_all(root.join("usr/bin"))?;
            self.installs.lock().unwrap().push(packages.to_vec());
            Ok(())
        }
    }

    fn cache(dir: &Path, packages: &[&str]) -> BuildCache {
        let mut recipe = Recipe::default();
        recipe.project.name = "demo".to_string();
        recipe.environment.host.packages = packages.iter().map(|s| s.to_string()).collect();
        BuildCache::open(dir.join("cache.json"), &recipe, &Target::host()).unwrap()
    }

    fn package(name: &str, pack_type: PackType) -> PackageInfo {
        PackageInfo {
            publisher: "acme".to_string(),
            name: name.to_string(),
            version: "1.0".to_string(),
            pack_type,
            options: IngredientOptions::default(),
        }
    }

    #[test]
    fn test_compose_base_packs_and_mounts() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::write(base.join("etc/os-release"), "ID=test\n").unwrap();

        let zlib = package("zlib", PackType::Ingredient);
        let pack = write_test_pack(dir.path(), &zlib, &[("lib/libz.so", "z")]);
        let layers = vec![
            Layer::BaseRootfs { source: base },
            Layer::VafsPackage { path: pack, package: zlib },
            Layer::HostDirectory {
                host: dir.path().join("src"),
                guest: PathBuf::from("/chef/project"),
                readonly: true,
            },
        ];

        let mut cache = cache(dir.path(), &[]);
        let composer = LayerComposer::new(dir.path().join("stage"));
        let composed = composer.compose(&layers, &mut cache).unwrap();
        let root = &composed.root;

        assert!(composed.rootfs_prepared);
        assert_eq!(fs::read_to_string(root.join("etc/os-release")).unwrap(), "ID=test\n");
        assert_eq!(
            fs::read_to_string(root.join("chef/pkgs/acme/zlib/1.0/lib/libz.so")).unwrap(),
            "z"
        );
        assert_eq!(
            fs::read_link(root.join("chef/pkgs/acme/zlib/current")).unwrap(),
            PathBuf::from("1.0")
        );
        assert!(root.join("chef/activate.sh").exists());
        assert_eq!(composed.mounts.len(), 1);
        assert!(!composed.mounts[0].writable);
        assert!(cache.has_key(SETUP_ROOTFS_KEY));

        // second compose reuses the staged rootfs
        let again = composer.compose(&layers, &mut cache).unwrap();
        assert!(!again.rootfs_prepared);
    }

    #[test]
    fn test_application_current_link() {
        let dir = TempDir::new().unwrap();
        let editor = package("editor", PackType::Application);
        let pack = write_test_pack(dir.path(), &editor, &[("bin/editor", "#!")]);
        let mut cache = cache(dir.path(), &[]);
        let composed = LayerComposer::new(dir.path().join("stage"))
            .compose(&[Layer::VafsPackage { path: pack, package: editor }], &mut cache)
            .unwrap();
        assert_eq!(
            fs::read_link(composed.root.join("chef/app/current")).unwrap(),
            PathBuf::from("acme/editor")
        );
        assert!(composed.root.join("chef/app/acme/editor/bin/editor").exists());
    }

    #[test]
    fn test_package_changes_reinstall_only_added() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingBootstrap::default());
        let stage = dir.path().join("stage");

        let mut first = cache(dir.path(), &["gcc"]);
        LayerComposer::new(&stage)
            .with_bootstrap(Box::new(recorder.clone()))
            .with_host_packages(vec!["gcc".to_string()])
            .compose(&[], &mut first)
            .unwrap();
        drop(first);

        let mut second = cache(dir.path(), &["gcc", "make"]);
        LayerComposer::new(&stage)
            .with_bootstrap(Box::new(recorder.clone()))
            .with_host_packages(vec!["gcc".to_string(), "make".to_string()])
            .compose(&[], &mut second)
            .unwrap();

        let installs = recorder.installs.lock().unwrap();
        assert_eq!(installs[0], vec!["gcc".to_string()]);
        assert_eq!(installs[1], vec!["make".to_string()]);
        assert!(second.calculate_package_changes().is_empty());
    }

    #[test]
    fn test_failed_extraction_keeps_staging_clean() {
        let dir = TempDir::new().unwrap();
        let broken = dir.path().join("broken.pack");
        fs::write(&broken, "not a pack").unwrap();
        let layers = vec![Layer::VafsPackage {
            path: broken,
            package: package("zlib", PackType::Ingredient),
        }];
        let mut cache = cache(dir.path(), &[]);
        let stage = dir.path().join("stage");
        assert!(LayerComposer::new(&stage).compose(&layers, &mut cache).is_err());

        let leftovers: Vec<_> = fs::read_dir(&stage)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(".compose-"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(!stage.join("chef/pkgs/acme/zlib").exists());
    }

    #[test]
    fn test_corrupt_pack_rolls_back_whole_pass() {
        let dir = TempDir::new().unwrap();
        let zlib = package("zlib", PackType::Ingredient);
        let good = write_test_pack(dir.path(), &zlib, &[("lib/libz.so", "z")]);
        let broken = dir.path().join("broken.pack");
        fs::write(&broken, "not a pack").unwrap();
        let layers = vec![
            Layer::VafsPackage { path: good, package: zlib },
            Layer::VafsPackage {
                path: broken,
                package: package("editor", PackType::Application),
            },
        ];

        let mut cache = cache(dir.path(), &[]);
        let stage = dir.path().join("stage");
        assert!(LayerComposer::new(&stage).compose(&layers, &mut cache).is_err());

        assert!(!stage.join("chef/pkgs/acme/zlib/1.0").exists());
        assert!(stage.join("chef/pkgs/acme/zlib/current").symlink_metadata().is_err());
        assert!(!stage.join("chef/app/acme/editor").exists());
        assert!(!stage.join("chef/activate.sh").exists());
    }

    #[test]
    fn test_disk_base_rejected_for_posix() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(dir.path(), &[]);
        let layers = vec![Layer::BaseRootfs {
            source: dir.path().join("base.vhdx"),
        }];
        let err = LayerComposer::new(dir.path().join("stage"))
            .compose(&layers, &mut cache)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let composed = LayerComposer::new(dir.path().join("win"))
            .with_style(GuestStyle::Windows)
            .compose(&layers, &mut cache)
            .unwrap();
        assert!(composed.activation.ends_with("chef/activate.ps1"));
    }
}
