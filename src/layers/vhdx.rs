// src/layers/vhdx.rs

//! Differencing-disk chains for Windows VM guests
//!
//! ```text
//! base-<hash>.vhdx  <-  app-<hash>.vhdx  <-  ...  <-  scratch.vhdx
//!   (cached)              (cached)                    (per build)
//! ```
//!
//! The base disk is keyed by the FNV-1a hash of its source path. Each pack
//! disk is keyed by the pack's publisher, name and version together with
//! the hash of the disk below it. Cached disks are never modified after
//! they are moved into place; only the scratch disk is written by a build.
//! Disk operations go through [`DiskTool`]; the PowerShell implementation
//! uses the Hyper-V cmdlets.

use crate::container::options::WindowsRootfsType;
use crate::error::{Error, Result};
use crate::hash::Fnv1a;
use crate::layers::{Layer, PackageInfo};
use crate::packager::artifact;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Timeout for quick control-plane commands
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for commands that copy disk contents
pub const BULK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Name of the disk inside a WSL distribution directory
pub const WSL_DISK: &str = "ext4.vhdx";
pub const SCRATCH_DISK: &str = "scratch.vhdx";

/// Operations on virtual disks
pub trait DiskTool: Send + Sync {
    /// Create a disk at `dest` holding a copy of the directory `source`
    fn create_from_directory(&self, source: &Path, dest: &Path) -> Result<()>;

    /// Create a differencing disk at `dest` on top of `parent`
    fn create_differencing(&self, parent: &Path, dest: &Path) -> Result<()>;

    /// Copy the tree at `content` into `guest_dir` of the disk
    fn copy_into(&self, disk: &Path, content: &Path, guest_dir: &Path) -> Result<()>;
}

/// A prepared disk chain, bottom first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxChain {
    pub base: PathBuf,
    pub layers: Vec<PathBuf>,
    /// Writable top of the chain, private to one build
    pub scratch: PathBuf,
}

impl VhdxChain {
    /// Parent of the scratch disk
    pub fn top_parent(&self) -> &Path {
        self.layers.last().unwrap_or(&self.base)
    }
}

/// Cache directory for base and pack disks
pub fn default_cache_dir() -> PathBuf {
    crate::config::chef_dir().join("vhdx")
}

pub fn base_hash(source: &Path) -> u64 {
    let mut state = Fnv1a::new();
    state.update_field(&source.display().to_string());
    state.finish()
}

pub fn package_hash(package: &PackageInfo, parent_hash: u64) -> u64 {
    let mut state = Fnv1a::new();
    state.update_field(&package.publisher);
    state.update_field(&package.name);
    state.update_field(&package.version);
    state.update_field(&format!("{parent_hash:016x}"));
    state.finish()
}

/// Move a finished temporary disk into the cache, or drop it when another
/// build got there first
fn publish(tmp: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        let _ = fs::remove_file(tmp);
        return Ok(());
    }
    fs::rename(tmp, dest)?;
    Ok(())
}

fn temp_disk(cache_dir: &Path, name: &str) -> PathBuf {
    cache_dir.join(format!(".{}-{}.tmp.vhdx", name, uuid::Uuid::new_v4().simple()))
}

/// Source disk of a base layer for the given guest type
fn base_source(source: &Path, rootfs_type: WindowsRootfsType) -> PathBuf {
    if rootfs_type == WindowsRootfsType::Wsl && source.is_dir() {
        source.join(WSL_DISK)
    } else {
        source.to_path_buf()
    }
}

fn is_vhdx(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("vhdx"))
}

/// Cache the base layer and return its disk and hash
fn prepare_base(
    tool: &dyn DiskTool,
    cache_dir: &Path,
    source: &Path,
    rootfs_type: WindowsRootfsType,
) -> Result<(PathBuf, u64)> {
    let source = base_source(source, rootfs_type);
    let hash = base_hash(&source);
    let disk = cache_dir.join(format!("base-{hash:016x}.vhdx"));
    if disk.exists() {
        debug!("Base disk cache hit: {}", disk.display());
        return Ok((disk, hash));
    }

    let tmp = temp_disk(cache_dir, "base");
    let result = if is_vhdx(&source) {
        fs::copy(&source, &tmp).map(|_| ()).map_err(Error::from)
    } else if source.is_dir() {
        tool.create_from_directory(&source, &tmp)
    } else {
        Err(Error::NotFound(format!("base rootfs {}", source.display())))
    };
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    publish(&tmp, &disk)?;
    info!("Cached base disk {}", disk.display());
    Ok((disk, hash))
}

fn prepare_package(
    tool: &dyn DiskTool,
    cache_dir: &Path,
    parent: &Path,
    parent_hash: u64,
    pack: &Path,
    package: &PackageInfo,
) -> Result<(PathBuf, u64)> {
    let hash = package_hash(package, parent_hash);
    let disk = cache_dir.join(format!("app-{hash:016x}.vhdx"));
    if disk.exists() {
        debug!("Package disk cache hit: {}/{}", package.publisher, package.name);
        return Ok((disk, hash));
    }

    let tmp = temp_disk(cache_dir, "app");
    let unpacked = tempfile::TempDir::new()?;
    let result = tool
        .create_differencing(parent, &tmp)
        .and_then(|_| artifact::extract(pack, unpacked.path(), &[]).map(|_| ()))
        .and_then(|_| tool.copy_into(&tmp, unpacked.path(), &package.install_dir()));
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    publish(&tmp, &disk)?;
    info!(
        "Cached package disk for {}/{} {}",
        package.publisher, package.name, package.version
    );
    Ok((disk, hash))
}

/// Build the disk chain for `layers` and a fresh scratch disk in `staging`
///
/// On failure the scratch disk is removed; cached parents stay.
pub fn prepare_layers(
    tool: &dyn DiskTool,
    cache_dir: &Path,
    staging: &Path,
    layers: &[Layer],
    rootfs_type: WindowsRootfsType,
) -> Result<VhdxChain> {
    fs::create_dir_all(cache_dir)?;
    fs::create_dir_all(staging)?;

    let mut bases = layers.iter().filter_map(|l| match l {
        Layer::BaseRootfs { source } => Some(source),
        _ => None,
    });
    let source = bases
        .next()
        .ok_or_else(|| Error::validation("layers", "a VM guest needs a base rootfs layer"))?;
    if bases.next().is_some() {
        return Err(Error::validation("layers", "more than one base rootfs layer"));
    }

    let (base, mut parent_hash) = prepare_base(tool, cache_dir, source, rootfs_type)?;
    let mut chain = VhdxChain {
        base,
        layers: Vec::new(),
        scratch: staging.join(SCRATCH_DISK),
    };

    if rootfs_type != WindowsRootfsType::Wsl {
        for layer in layers {
            if let Layer::VafsPackage { path, package } = layer {
                let parent = chain.top_parent().to_path_buf();
                let (disk, hash) =
                    prepare_package(tool, cache_dir, &parent, parent_hash, path, package)?;
                chain.layers.push(disk);
                parent_hash = hash;
            }
        }
    } else if layers.iter().any(|l| matches!(l, Layer::VafsPackage { .. })) {
        warn!("WSL guests take packs through the chef share, not disk layers");
    }

    if chain.scratch.exists() {
        fs::remove_file(&chain.scratch)?;
    }
    if let Err(e) = tool.create_differencing(chain.top_parent(), &chain.scratch) {
        let _ = fs::remove_file(&chain.scratch);
        return Err(e);
    }
    Ok(chain)
}

/// Hyper-V cmdlets through `powershell.exe`
#[derive(Debug, Clone)]
pub struct PowerShellDiskTool {
    program: String,
}

impl Default for PowerShellDiskTool {
    fn default() -> Self {
        Self {
            program: "powershell.exe".to_string(),
        }
    }
}

/// Quote for a single-quoted PowerShell string
fn ps_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

impl PowerShellDiskTool {
    fn run(&self, script: &str, timeout: Duration) -> Result<()> {
        debug!("powershell: {}", script);
        let mut child = Command::new(&self.program)
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::MissingDependency(format!("{}: {}", self.program, e)))?;

        match child.wait_timeout(timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use std::io::Read;
                    let _ = pipe.read_to_string(&mut stderr);
                }
                Err(Error::ContainerError(format!(
                    "powershell exited with {}: {}",
                    status,
                    stderr.trim()
                )))
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::ContainerError(format!(
                    "powershell timed out after {:?}",
                    timeout
                )))
            }
        }
    }

    /// Mount `disk`, run `body` with `$root` set to its drive, then dismount
    fn with_mounted(&self, disk: &Path, body: &str, timeout: Duration) -> Result<()> {
        let script = format!(
            "$ErrorActionPreference='Stop'; \
             $d = Mount-VHD -Path {disk} -Passthru | Get-Disk; \
             try {{ $p = $d | Get-Partition | Where-Object {{ $_.DriveLetter }} | Select-Object -First 1; \
             $root = \"$($p.DriveLetter):\\\"; {body} }} \
             finally {{ Dismount-VHD -Path {disk} }}",
            disk = ps_quote(disk),
        );
        self.run(&script, timeout)
    }
}

impl DiskTool for PowerShellDiskTool {
    fn create_from_directory(&self, source: &Path, dest: &Path) -> Result<()> {
        let create = format!(
            "$ErrorActionPreference='Stop'; \
             New-VHD -Path {dest} -SizeBytes 64GB -Dynamic | Mount-VHD -Passthru | \
             Initialize-Disk -PartitionStyle GPT -Passthru | \
             New-Partition -AssignDriveLetter -UseMaximumSize | \
             Format-Volume -FileSystem NTFS -Confirm:$false | Out-Null; \
             Dismount-VHD -Path {dest}",
            dest = ps_quote(dest),
        );
        self.run(&create, CONTROL_TIMEOUT)?;
        self.with_mounted(
            dest,
            &format!("Copy-Item -Path (Join-Path {} '*') -Destination $root -Recurse -Force", ps_quote(source)),
            BULK_TIMEOUT,
        )
    }

    fn create_differencing(&self, parent: &Path, dest: &Path) -> Result<()> {
        self.run(
            &format!(
                "$ErrorActionPreference='Stop'; New-VHD -Path {} -ParentPath {} -Differencing | Out-Null",
                ps_quote(dest),
                ps_quote(parent)
            ),
            CONTROL_TIMEOUT,
        )
    }

    fn copy_into(&self, disk: &Path, content: &Path, guest_dir: &Path) -> Result<()> {
        let body = format!(
            "$t = Join-Path $root {dir}; New-Item -ItemType Directory -Force -Path $t | Out-Null; \
             Copy-Item -Path (Join-Path {src} '*') -Destination $t -Recurse -Force",
            dir = ps_quote(guest_dir),
            src = ps_quote(content),
        );
        self.with_mounted(disk, &body, BULK_TIMEOUT)
    }
}
