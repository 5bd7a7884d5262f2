// src/container/lock.rs

//! Single-writer lock on a container rootfs
//!
//! A rootfs belongs to one build at a time. The lock is an exclusive
//! `flock` on `.bake.lock` at the root of the tree and is released when
//! the guard is dropped.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = ".bake.lock";

#[derive(Debug)]
pub struct RootfsLock {
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl RootfsLock {
    /// Take the lock without blocking; a held lock is an error
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let file = File::create(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked rootfs {:?}", root);
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::ContainerError(
                format!("rootfs {} is in use by another build", root.display()),
            )),
            Err(e) => Err(Error::IoError(format!(
                "Failed to lock rootfs {}: {}",
                root.display(),
                e
            ))),
        }
    }

    /// Whether some other handle holds the lock
    pub fn is_held(root: &Path) -> bool {
        let Ok(file) = File::open(root.join(LOCK_FILE)) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootfsLock {
    fn drop(&mut self) {
        debug!("Released rootfs lock {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_single_writer() {
        let dir = TempDir::new().unwrap();
        let lock = RootfsLock::acquire(dir.path()).unwrap();
        assert!(lock.path().ends_with(LOCK_FILE));
        assert!(RootfsLock::is_held(dir.path()));
        assert!(RootfsLock::acquire(dir.path()).is_err());

        drop(lock);
        assert!(!RootfsLock::is_held(dir.path()));
        let _again = RootfsLock::acquire(dir.path()).unwrap();
    }
}
