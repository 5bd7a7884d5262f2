// src/layers/rootfs.rs

//! Base rootfs staging and host package bootstrap

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Copy the tree at `source` into `dest`, keeping symlinks and modes
///
/// Existing files in `dest` are overwritten; extra files are left alone.
/// Returns the number of entries copied.
pub fn snapshot(source: &Path, dest: &Path) -> Result<usize> {
    if !source.is_dir() {
        return Err(Error::NotFound(format!(
            "base rootfs directory {}",
            source.display()
        )));
    }
    fs::create_dir_all(dest)?;

    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| Error::IoError(format!("snapshot walk: {}", e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            make_symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
        copied += 1;
    }
    debug!("Snapshotted {} entries from {:?}", copied, source);
    Ok(copied)
}

#[cfg(unix)]
pub(crate) fn make_symlink(link: &Path, at: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, at)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn make_symlink(link: &Path, at: &Path) -> Result<()> {
    let resolved = at.parent().map(|p| p.join(link)).unwrap_or_else(|| link.to_path_buf());
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(link, at)?;
    } else {
        std::os::windows::fs::symlink_file(link, at)?;
    }
    Ok(())
}

/// Installs host packages into a staged rootfs
pub trait Bootstrap {
    fn name(&self) -> &str;

    fn install(&self, root: &Path, packages: &[String]) -> Result<()>;
}

/// Package managers that can install into an alternate root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dnf,
    Zypper,
    Pacman,
    Apk,
    Debootstrap,
}

impl PackageManager {
    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Dnf => "dnf",
            PackageManager::Zypper => "zypper",
            PackageManager::Pacman => "pacman",
            PackageManager::Apk => "apk",
            PackageManager::Debootstrap => "debootstrap",
        }
    }

    /// First supported manager found on `PATH`
    pub fn detect() -> Option<Self> {
        [
            PackageManager::Dnf,
            PackageManager::Zypper,
            PackageManager::Pacman,
            PackageManager::Apk,
            PackageManager::Debootstrap,
        ]
        .into_iter()
        .find(|pm| which::which(pm.program()).is_ok())
    }

    /// Arguments installing `packages` under `root`
    pub fn install_args(&self, root: &Path, packages: &[String]) -> Vec<String> {
        let root = root.display().to_string();
        let mut args: Vec<String> = match self {
            PackageManager::Dnf => vec![
                "install".into(),
                "-y".into(),
                "--setopt=install_weak_deps=False".into(),
                format!("--installroot={root}"),
            ],
            PackageManager::Zypper => vec![
                "--non-interactive".into(),
                "--root".into(),
                root,
                "install".into(),
            ],
            PackageManager::Pacman => vec![
                "-S".into(),
                "--noconfirm".into(),
                "--needed".into(),
                "--root".into(),
                root,
            ],
            PackageManager::Apk => vec![
                "add".into(),
                "--root".into(),
                root,
                "--initdb".into(),
                "--no-cache".into(),
            ],
            PackageManager::Debootstrap => {
                let mut args = vec!["--variant=minbase".to_string()];
                if !packages.is_empty() {
                    args.push(format!("--include={}", packages.join(",")));
                }
                args.push("stable".into());
                args.push(root);
                return args;
            }
        };
        args.extend(packages.iter().cloned());
        args
    }
}

/// Bootstrap driven by the host's package manager
#[derive(Debug, Clone)]
pub struct PackageManagerBootstrap {
    manager: PackageManager,
    program: PathBuf,
}

impl PackageManagerBootstrap {
    pub fn new(manager: PackageManager) -> Result<Self> {
        let program = which::which(manager.program()).map_err(|_| {
            Error::MissingDependency(format!("{} is not installed", manager.program()))
        })?;
        Ok(Self { manager, program })
    }

    pub fn detect() -> Result<Self> {
        let manager = PackageManager::detect().ok_or_else(|| {
            Error::MissingDependency(
                "no package manager able to bootstrap a rootfs was found".to_string(),
            )
        })?;
        Self::new(manager)
    }
}

impl Bootstrap for PackageManagerBootstrap {
    fn name(&self) -> &str {
        self.manager.program()
    }

    fn install(&self, root: &Path, packages: &[String]) -> Result<()> {
        if packages.is_empty() && self.manager != PackageManager::Debootstrap {
            return Ok(());
        }
        info!(
            "Installing {} host package(s) with {}",
            packages.len(),
            self.manager.program()
        );
        let output = Command::new(&self.program)
            .args(self.manager.install_args(root, packages))
            .output()
            .map_err(|e| Error::MissingDependency(format!("{}: {}", self.program.display(), e)))?;
        if !output.status.success() {
            return Err(Error::MissingDependency(format!(
                "{} failed: {}",
                self.manager.program(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Bootstrap that installs nothing, for recipes without host packages
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBootstrap;

impl Bootstrap for NoBootstrap {
    fn name(&self) -> &str {
        "none"
    }

    fn install(&self, _root: &Path, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingDependency(format!(
                "cannot install host packages without a package manager: {}",
                packages.join(", ")
            )))
        }
    }
}
