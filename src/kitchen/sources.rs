// src/kitchen/sources.rs

//! Fetching part sources that do not live in the project directory
//!
//! URL and git sources are materialized on the host under
//! `chef/data/sources/<part>` once; a populated directory is reused.
//! Script sources run inside the container and are handled by the
//! scheduler.

use crate::error::{Error, Result};
use crate::recipe::{Part, Source};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

fn is_populated(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Make the sources of `part` available in `dest`; returns whether
/// anything was fetched
pub fn fetch_part(part: &Part, dest: &Path) -> Result<bool> {
    match &part.source {
        Source::Path(_) | Source::Script(_) => Ok(false),
        _ if is_populated(dest) => {
            debug!("Sources of {} already present", part.name);
            Ok(false)
        }
        Source::Url(url) => {
            fetch_url(url, dest)?;
            Ok(true)
        }
        Source::Git {
            url,
            branch,
            commit,
        } => {
            fetch_git(url, branch.as_deref(), commit.as_deref(), dest)?;
            Ok(true)
        }
    }
}

fn fetch_url(url: &str, dest: &Path) -> Result<()> {
    info!("Downloading {}", url);
    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| Error::IoError(format!("http client: {}", e)))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| Error::MissingDependency(format!("download {}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(Error::MissingDependency(format!(
            "download {}: HTTP {}",
            url,
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .map_err(|e| Error::MissingDependency(format!("download {}: {}", url, e)))?;

    let parent = dest
        .parent()
        .ok_or_else(|| Error::IoError(format!("invalid source dir {}", dest.display())))?;
    fs::create_dir_all(parent)?;
    let staging = tempfile::TempDir::new_in(parent)?;
    if url.ends_with(".tar") {
        extract_archive(&bytes[..], staging.path())?;
    } else {
        extract_archive(GzDecoder::new(&bytes[..]), staging.path())?;
    }
    install_tree(staging.path(), dest)
}

/// Unpack a tar stream into `dest`
pub(crate) fn extract_archive<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| Error::IoError(format!("extract archive into {}: {}", dest.display(), e)))
}

/// Move an extracted tree into place, dropping a single top-level directory
pub(crate) fn install_tree(extracted: &Path, dest: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(extracted)?.collect::<std::io::Result<_>>()?;
    let root = match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => only.path(),
        _ => extracted.to_path_buf(),
    };
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::rename(&root, dest)?;
    Ok(())
}

fn git(args: &[&str], cwd: Option<&Path>) -> Result<()> {
    let program = which::which("git")
        .map_err(|_| Error::MissingDependency("git is not installed".to_string()))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    let output = cmd
        .output()
        .map_err(|e| Error::IoError(format!("git {}: {}", args.join(" "), e)))?;
    if !output.status.success() {
        return Err(Error::MissingDependency(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn fetch_git(url: &str, branch: Option<&str>, commit: Option<&str>, dest: &Path) -> Result<()> {
    info!("Cloning {}", url);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    let dest_str = dest.display().to_string();
    let mut args = vec!["clone", "--recurse-submodules"];
    if let Some(branch) = branch {
        args.extend(["--branch", branch]);
    }
    if commit.is_none() {
        args.extend(["--depth", "1"]);
    }
    args.extend([url, dest_str.as_str()]);

    let cloned = git(&args, None).and_then(|_| match commit {
        Some(commit) => git(&["checkout", "--quiet", commit], Some(dest)),
        None => Ok(()),
    });
    if cloned.is_err() {
        let _ = fs::remove_dir_all(dest);
    }
    cloned
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_path_sources_need_no_fetch() {
        let dir = TempDir::new().unwrap();
        let part = Part {
            name: "zlib".to_string(),
            ..Default::default()
        };
        assert!(!fetch_part(&part, &dir.path().join("zlib")).unwrap());
    }

    #[test]
    fn test_populated_dir_is_reused() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("zlib");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("configure"), "#!/bin/sh").unwrap();
        let part = Part {
            name: "zlib".to_string(),
            source: Source::Url("https://example.invalid/zlib.tar.gz".to_string()),
            ..Default::default()
        };
        assert!(!fetch_part(&part, &dest).unwrap());
    }

    #[test]
    fn test_archive_top_level_dir_is_stripped() {
        let dir = TempDir::new().unwrap();
        let data = tarball(&[("zlib-1.3/configure", "x"), ("zlib-1.3/zlib.h", "y")]);
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        extract_archive(GzDecoder::new(&data[..]), &staging).unwrap();

        let dest = dir.path().join("sources/zlib");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        install_tree(&staging, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("configure")).unwrap(), "x");
        assert!(dest.join("zlib.h").exists());
    }

    #[test]
    fn test_flat_archive_is_kept() {
        let dir = TempDir::new().unwrap();
        let data = tarball(&[("configure", "x"), ("README", "y")]);
        let staging = dir.path().join("staging");
        fs::create_dir_all(&staging).unwrap();
        extract_archive(GzDecoder::new(&data[..]), &staging).unwrap();
        let dest = dir.path().join("out");
        install_tree(&staging, &dest).unwrap();
        assert!(dest.join("configure").exists());
        assert!(dest.join("README").exists());
    }
}
