// src/container/transfer.rs

//! File copies between the host and a container rootfs
//!
//! Each file lands through a temporary sibling that is renamed into place,
//! so a guest never observes a partial file. Requests are processed in
//! batches of [`BATCH_SIZE`]; the first failure aborts the remaining
//! entries and leaves the files already copied where they are. A file whose
//! destination already has the same size and XXH128 digest is not copied.

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, hash_file};
use crate::policy::guest_to_host;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const BATCH_SIZE: usize = 64;

/// A single host/guest path pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub host: PathBuf,
    pub guest: PathBuf,
}

impl FileTransfer {
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
        }
    }
}

/// Copy one file so that `dest` is replaced in a single rename
pub fn copy_atomic(source: &Path, dest: &Path) -> Result<u64> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let mut input = File::open(source)
        .map_err(|e| Error::IoError(format!("open {}: {}", source.display(), e)))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let copied = io::copy(&mut input, tmp.as_file_mut())?;
    tmp.as_file().set_permissions(fs::metadata(source)?.permissions())?;
    tmp.persist(dest)
        .map_err(|e| Error::IoError(format!("replace {}: {}", dest.display(), e.error)))?;
    Ok(copied)
}

/// Whether `dest` already holds the contents of `source`
fn unchanged(source: &Path, dest: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (fs::metadata(source), fs::metadata(dest)) else {
        return false;
    };
    if !dst.is_file() || src.len() != dst.len() {
        return false;
    }
    match (
        hash_file(HashAlgorithm::Xxh128, source),
        hash_file(HashAlgorithm::Xxh128, dest),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Copy unless the destination is already up to date; returns whether it copied
fn sync_file(source: &Path, dest: &Path) -> Result<bool> {
    if unchanged(source, dest) {
        debug!("{} is up to date", dest.display());
        return Ok(false);
    }
    copy_atomic(source, dest)?;
    Ok(true)
}

/// Returns the number of files actually copied
fn run_batches<F>(files: &[FileTransfer], mut copy: F) -> Result<usize>
where
    F: FnMut(&FileTransfer) -> Result<bool>,
{
    let mut copied = 0;
    for (index, batch) in files.chunks(BATCH_SIZE).enumerate() {
        debug!("Transfer batch {} ({} files)", index, batch.len());
        for file in batch {
            if copy(file)? {
                copied += 1;
            }
        }
    }
    Ok(copied)
}

/// Copy host files into the rootfs at `root`
pub fn upload(root: &Path, files: &[FileTransfer]) -> Result<usize> {
    run_batches(files, |file| sync_file(&file.host, &guest_to_host(root, &file.guest)))
}

/// Copy files out of the rootfs at `root` onto the host
pub fn download(root: &Path, files: &[FileTransfer]) -> Result<usize> {
    run_batches(files, |file| sync_file(&guest_to_host(root, &file.guest), &file.host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upload_download() {
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        fs::write(host.path().join("a.txt"), "alpha").unwrap();

        let n = upload(
            root.path(),
            &[FileTransfer::new(host.path().join("a.txt"), "/chef/data/a.txt")],
        )
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            fs::read_to_string(root.path().join("chef/data/a.txt")).unwrap(),
            "alpha"
        );

        let out = host.path().join("out/a.txt");
        download(root.path(), &[FileTransfer::new(&out, "/chef/data/a.txt")]).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), "alpha");
    }

    #[test]
    fn test_unchanged_files_are_skipped() {
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        fs::write(host.path().join("a.txt"), "alpha").unwrap();
        let files = [FileTransfer::new(host.path().join("a.txt"), "/in/a.txt")];

        assert_eq!(upload(root.path(), &files).unwrap(), 1);
        assert_eq!(upload(root.path(), &files).unwrap(), 0);

        fs::write(host.path().join("a.txt"), "omega").unwrap();
        assert_eq!(upload(root.path(), &files).unwrap(), 1);
        assert_eq!(fs::read_to_string(root.path().join("in/a.txt")).unwrap(), "omega");
    }

    #[test]
    fn test_failure_keeps_earlier_files() {
        let host = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let mut files = Vec::new();
        for i in 0..(BATCH_SIZE + 6) {
            let name = format!("f{i}");
            fs::write(host.path().join(&name), &name).unwrap();
            files.push(FileTransfer::new(host.path().join(&name), format!("/in/{name}")));
        }
        files.insert(70, FileTransfer::new(host.path().join("missing"), "/in/missing"));

        assert!(upload(root.path(), &files).is_err());
        assert!(root.path().join("in/f0").exists());
        assert!(root.path().join("in/f69").exists());
        assert!(!root.path().join("in/f70").exists());
    }
}
