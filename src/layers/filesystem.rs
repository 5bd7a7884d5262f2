// src/layers/filesystem.rs

//! Write targets for extracted content
//!
//! Pack extraction writes through [`Filesystem`] so the same code can fill
//! a directory tree or a disk image. Disk-image codecs live outside this
//! crate; [`DirectoryFilesystem`] is the tree-backed implementation.

use crate::error::{Error, Result};
use crate::layers::rootfs::make_symlink;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Reserved area written by `write_raw` (boot sectors on real images)
pub const RESERVED_FILE: &str = ".reserved";

pub trait Filesystem {
    fn name(&self) -> &str;

    /// Copy a whole host tree into the filesystem root
    fn set_content(&mut self, source: &Path) -> Result<()>;

    /// Start from an empty filesystem
    fn format(&mut self) -> Result<()>;

    fn create_directory(&mut self, path: &str) -> Result<()>;

    fn create_file(&mut self, path: &str, data: &[u8], mode: u32) -> Result<()>;

    fn create_symlink(&mut self, path: &str, target: &str) -> Result<()>;

    /// Write bytes at an absolute offset of the reserved area
    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// Resolve a filesystem-relative path, refusing escapes
fn resolve(root: &Path, path: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            _ => {
                return Err(Error::IoError(format!(
                    "path '{}' escapes the filesystem root",
                    path
                )));
            }
        }
    }
    Ok(out)
}

/// A filesystem that is a directory on the host
#[derive(Debug)]
pub struct DirectoryFilesystem {
    root: PathBuf,
    files_written: usize,
    finished: bool,
}

impl DirectoryFilesystem {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            files_written: 0,
            finished: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_written(&self) -> usize {
        self.files_written
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(Error::IoError(format!(
                "filesystem {} is already finished",
                self.root.display()
            )));
        }
        Ok(())
    }
}

impl Filesystem for DirectoryFilesystem {
    fn name(&self) -> &str {
        "directory"
    }

    fn set_content(&mut self, source: &Path) -> Result<()> {
        self.check_open()?;
        for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| Error::IoError(e.to_string()))?;
            let target = self.root.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                fs::copy(entry.path(), &target)?;
                self.files_written += 1;
            }
        }
        Ok(())
    }

    fn format(&mut self) -> Result<()> {
        self.check_open()?;
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        self.files_written = 0;
        Ok(())
    }

    fn create_directory(&mut self, path: &str) -> Result<()> {
        self.check_open()?;
        fs::create_dir_all(resolve(&self.root, path)?)?;
        Ok(())
    }

    fn create_file(&mut self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        self.check_open()?;
        let target = resolve(&self.root, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        self.files_written += 1;
        Ok(())
    }

    fn create_symlink(&mut self, path: &str, target: &str) -> Result<()> {
        self.check_open()?;
        let at = resolve(&self.root, path)?;
        if let Some(parent) = at.parent() {
            fs::create_dir_all(parent)?;
        }
        if at.symlink_metadata().is_ok() {
            fs::remove_file(&at)?;
        }
        make_symlink(Path::new(target), &at)?;
        self.files_written += 1;
        Ok(())
    }

    fn write_raw(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(RESERVED_FILE))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
