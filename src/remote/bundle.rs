// src/remote/bundle.rs

//! Source bundles uploaded for remote builds
//!
//! A bundle is a gzip-compressed tar of the project directory. Version
//! control metadata and local chef state never leave the machine.

use crate::error::{Error, Result};
use crate::packager::artifact::source_date_epoch;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs;
use std::io::Write;
use std::path::Path;
use tar::{Builder, EntryType, Header};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Directory names left out of every bundle
pub const EXCLUDED_DIRS: &[&str] = &[".git", ".chef"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleStats {
    pub files: usize,
    pub bytes: u64,
}

fn is_excluded(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}

fn header(kind: EntryType, mode: u32, size: u64, mtime: u64) -> Header {
    let mut head = Header::new_gnu();
    head.set_entry_type(kind);
    head.set_mode(mode);
    head.set_size(size);
    head.set_mtime(mtime);
    head.set_uid(0);
    head.set_gid(0);
    head
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

/// Write a bundle of `project_dir` to `out`
pub fn write_bundle<W: Write>(project_dir: &Path, out: W) -> Result<BundleStats> {
    let mtime = source_date_epoch();
    let mut stats = BundleStats::default();
    let mut archive = Builder::new(GzEncoder::new(out, Compression::default()));

    let walker = WalkDir::new(project_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded(e));
    for entry in walker {
        let entry = entry.map_err(|e| Error::IoError(format!("walk project: {}", e)))?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(project_dir)
            .map_err(|e| Error::IoError(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let mut head = header(EntryType::Symlink, 0o777, 0, mtime);
            archive.append_link(&mut head, &rel, &target)?;
        } else if file_type.is_dir() {
            let mut head = header(EntryType::Directory, 0o755, 0, mtime);
            archive.append_data(&mut head, &rel, std::io::empty())?;
        } else {
            let meta = entry.metadata().map_err(|e| Error::IoError(e.to_string()))?;
            let mut head = header(EntryType::Regular, file_mode(&meta), meta.len(), mtime);
            archive.append_data(&mut head, &rel, fs::File::open(entry.path())?)?;
            stats.files += 1;
            stats.bytes += meta.len();
        }
    }

    archive.into_inner()?.finish()?;
    debug!(
        "Bundled {} ({} files, {} bytes)",
        project_dir.display(),
        stats.files,
        stats.bytes
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn entries(bundle: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bundle));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_bundle_skips_vcs_and_chef_state() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join(".chef")).unwrap();
        fs::write(root.join("recipe.yaml"), "project: {}").unwrap();
        fs::write(root.join("src/main.c"), "int main() {}").unwrap();
        fs::write(root.join(".git/HEAD"), "ref").unwrap();
        fs::write(root.join(".chef/cache"), "x").unwrap();
        fs::write(root.join(".gitignore"), "build/").unwrap();

        let mut out = Vec::new();
        let stats = write_bundle(root, &mut out).unwrap();
        assert_eq!(stats.files, 3);

        let names = entries(&out);
        assert!(names.contains(&"recipe.yaml".to_string()));
        assert!(names.contains(&"src/main.c".to_string()));
        assert!(names.contains(&".gitignore".to_string()));
        assert!(names.iter().all(|n| !n.starts_with(".git/") && !n.starts_with(".chef")));
    }
}
