// src/packager/artifact.rs

//! The `.pack` container format
//!
//! A pack is a gzip-compressed tar archive:
//!
//! ```text
//! MANIFEST.json     metadata and a SHA-256 per file
//! MANIFEST.sig      optional Ed25519 signature over MANIFEST.json
//! files/...         the payload, relative to the install root
//! ```
//!
//! Entries are written in sorted order with a fixed mtime, owner 0:0 and
//! normalized modes, so packing the same tree twice gives the same bytes.

use crate::error::{Error, Result};
use crate::hash::sha256;
use crate::layers::filesystem::{DirectoryFilesystem, Filesystem};
use crate::packager::filter::PathFilter;
use crate::packager::signing::{PackSignature, SigningKeyPair};
use crate::recipe::{IngredientOptions, PackCommand, PackType};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

pub const MANIFEST_NAME: &str = "MANIFEST.json";
pub const SIGNATURE_NAME: &str = "MANIFEST.sig";
pub const FILES_DIR: &str = "files";

/// 2024-01-01 00:00:00 UTC
pub const DEFAULT_MTIME: u64 = 1704067200;

/// Entry timestamp: `SOURCE_DATE_EPOCH` when set, otherwise a fixed date
pub fn source_date_epoch() -> u64 {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_MTIME)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// Empty for symlinks
    pub sha256: String,
    pub size: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub publisher: String,
    pub version: String,
    #[serde(rename = "type")]
    pub pack_type: String,
    pub platform: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<IngredientOptions>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<PackCommand>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn pack_type(&self) -> Result<PackType> {
        self.pack_type
            .parse()
            .map_err(|_| Error::PackError(format!("unknown pack type '{}'", self.pack_type)))
    }

    /// File name of the pack holding this manifest
    pub fn file_name(&self, digest: &str) -> String {
        format!(
            "{}-{}-{}-{}-{}.pack",
            self.name,
            self.platform,
            self.arch,
            self.version,
            &digest[..digest.len().min(12)]
        )
    }
}

/// Normalized archive mode: executables 0755, everything else 0644
fn normalize_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 { 0o755 } else { 0o644 }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

enum Item {
    Dir(String),
    File { rel: String, host: PathBuf, mode: u32 },
    Link { rel: String, target: String },
}

/// Walk `root` in sorted order, keeping what `filter` selects
fn collect(root: &Path, filter: &PathFilter) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(format!("walk {}: {}", root.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::IoError(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if filter.may_contain(&rel) {
                items.push(Item::Dir(rel));
            }
        } else if filter.matches(&rel) {
            if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                items.push(Item::Link {
                    rel,
                    target: target.to_string_lossy().into_owned(),
                });
            } else {
                let meta = entry
                    .metadata()
                    .map_err(|e| Error::IoError(format!("stat {}: {}", entry.path().display(), e)))?;
                items.push(Item::File {
                    rel,
                    host: entry.path().to_path_buf(),
                    mode: normalize_mode(file_mode(&meta)),
                });
            }
        }
    }
    Ok(items)
}

/// Hash every selected file in parallel, preserving order
fn file_table(items: &[Item]) -> Result<Vec<FileEntry>> {
    items
        .par_iter()
        .filter_map(|item| match item {
            Item::Dir(_) => None,
            Item::File { rel, host, mode } => Some(fs::read(host).map_err(Error::from).map(|data| {
                FileEntry {
                    path: rel.clone(),
                    sha256: sha256(&data),
                    size: data.len() as u64,
                    mode: *mode,
                    link: None,
                }
            })),
            Item::Link { rel, target } => Some(Ok(FileEntry {
                path: rel.clone(),
                sha256: String::new(),
                size: 0,
                mode: 0o777,
                link: Some(target.clone()),
            })),
        })
        .collect()
}

fn header(entry_type: EntryType, mode: u32, size: u64, mtime: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_bytes<W: std::io::Write>(
    archive: &mut Builder<W>,
    path: &str,
    data: &[u8],
    mtime: u64,
) -> Result<()> {
    let mut head = header(EntryType::Regular, 0o644, data.len() as u64, mtime);
    archive.append_data(&mut head, path, data)?;
    Ok(())
}

/// Write a pack of the files under `root` selected by `filter`
///
/// `manifest.files` is replaced by the computed file table. The pack lands
/// in `out_dir` under its content-addressed name, which is returned.
pub fn write_pack(
    root: &Path,
    filter: &PathFilter,
    mut manifest: Manifest,
    out_dir: &Path,
    key: Option<&SigningKeyPair>,
) -> Result<PathBuf> {
    let items = collect(root, filter)?;
    manifest.files = file_table(&items)?;
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let digest = sha256(&manifest_bytes);

    fs::create_dir_all(out_dir)?;
    let dest = out_dir.join(manifest.file_name(&digest));
    let tmp = tempfile::NamedTempFile::new_in(out_dir)?;
    let mtime = source_date_epoch();

    let encoder = GzEncoder::new(tmp.reopen()?, Compression::default());
    let mut archive = Builder::new(encoder);
    append_bytes(&mut archive, MANIFEST_NAME, &manifest_bytes, mtime)?;
    if let Some(key) = key {
        let signature = serde_json::to_vec_pretty(&key.sign(&manifest_bytes))?;
        append_bytes(&mut archive, SIGNATURE_NAME, &signature, mtime)?;
    }

    let mut dir_head = header(EntryType::Directory, 0o755, 0, mtime);
    archive.append_data(&mut dir_head, FILES_DIR, std::io::empty())?;
    for item in &items {
        match item {
            Item::Dir(rel) => {
                let mut head = header(EntryType::Directory, 0o755, 0, mtime);
                archive.append_data(&mut head, format!("{FILES_DIR}/{rel}"), std::io::empty())?;
            }
            Item::File { rel, host, mode } => {
                let data = fs::read(host)?;
                let mut head = header(EntryType::Regular, *mode, data.len() as u64, mtime);
                archive.append_data(&mut head, format!("{FILES_DIR}/{rel}"), data.as_slice())?;
            }
            Item::Link { rel, target } => {
                let mut head = header(EntryType::Symlink, 0o777, 0, mtime);
                archive.append_link(&mut head, format!("{FILES_DIR}/{rel}"), target)?;
            }
        }
    }
    let encoder = archive.into_inner()?;
    encoder.finish()?;

    tmp.persist(&dest).map_err(|e| e.error)?;
    debug!("Wrote pack {} ({} files)", dest.display(), manifest.files.len());
    Ok(dest)
}

fn open_archive(pack: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(pack)
        .map_err(|e| Error::PackError(format!("open {}: {}", pack.display(), e)))?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

fn pack_error(pack: &Path, e: impl std::fmt::Display) -> Error {
    Error::PackError(format!("{}: {}", pack.display(), e))
}

fn parse_manifest(pack: &Path, bytes: &[u8]) -> Result<Manifest> {
    serde_json::from_slice(bytes).map_err(|e| pack_error(pack, format!("bad manifest: {}", e)))
}

/// Manifest bytes and signature of a pack
fn read_header(pack: &Path) -> Result<(Vec<u8>, Option<PackSignature>)> {
    let mut archive = open_archive(pack)?;
    let mut manifest = None;
    let mut signature = None;
    for entry in archive.entries().map_err(|e| pack_error(pack, e))? {
        let mut entry = entry.map_err(|e| pack_error(pack, e))?;
        let path = entry.path().map_err(|e| pack_error(pack, e))?.to_path_buf();
        if path == Path::new(MANIFEST_NAME) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            manifest = Some(bytes);
        } else if path == Path::new(SIGNATURE_NAME) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            signature = Some(serde_json::from_slice(&bytes).map_err(|e| pack_error(pack, e))?);
        } else {
            break;
        }
    }
    let manifest = manifest.ok_or_else(|| pack_error(pack, "missing MANIFEST.json"))?;
    Ok((manifest, signature))
}

pub fn read_manifest(pack: &Path) -> Result<Manifest> {
    let (bytes, _) = read_header(pack)?;
    parse_manifest(pack, &bytes)
}

/// Verify the pack signature; unsigned packs are an error
///
/// With `trusted` set, the signing key must match it.
pub fn verify(pack: &Path, trusted: Option<&str>) -> Result<Manifest> {
    let (bytes, signature) = read_header(pack)?;
    let signature = signature.ok_or_else(|| pack_error(pack, "pack is not signed"))?;
    if let Some(key) = trusted {
        if signature.public_key != key {
            return Err(pack_error(pack, "signed by an untrusted key"));
        }
    }
    signature.verify(&bytes)?;
    parse_manifest(pack, &bytes)
}

/// Extract the payload of `pack` through a [`Filesystem`]
///
/// Only paths selected by `include` are written. File contents are checked
/// against the manifest as they are extracted.
pub fn unpack_into(pack: &Path, target: &mut dyn Filesystem, include: &[String]) -> Result<Manifest> {
    let filter = PathFilter::new(include)?;
    let mut archive = open_archive(pack)?;
    let mut manifest: Option<Manifest> = None;
    let mut expected: HashMap<String, String> = HashMap::new();

    for entry in archive.entries().map_err(|e| pack_error(pack, e))? {
        let mut entry = entry.map_err(|e| pack_error(pack, e))?;
        let path = entry.path().map_err(|e| pack_error(pack, e))?.to_path_buf();

        if path == Path::new(MANIFEST_NAME) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            let parsed = parse_manifest(pack, &bytes)?;
            expected = parsed
                .files
                .iter()
                .map(|f| (f.path.clone(), f.sha256.clone()))
                .collect();
            manifest = Some(parsed);
            continue;
        }
        let Ok(rel) = path.strip_prefix(FILES_DIR) else {
            continue;
        };
        if manifest.is_none() {
            return Err(pack_error(pack, "payload before MANIFEST.json"));
        }
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel.is_empty() {
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                if filter.may_contain(&rel) {
                    target.create_directory(&rel)?;
                }
            }
            EntryType::Symlink => {
                if filter.matches(&rel) {
                    let link = entry
                        .link_name()
                        .map_err(|e| pack_error(pack, e))?
                        .ok_or_else(|| pack_error(pack, format!("symlink {} has no target", rel)))?;
                    target.create_symlink(&rel, &link.to_string_lossy())?;
                }
            }
            EntryType::Regular => {
                if !filter.matches(&rel) {
                    continue;
                }
                let mode = entry.header().mode().map_err(|e| pack_error(pack, e))?;
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                match expected.get(&rel) {
                    Some(hash) if *hash == sha256(&data) => {}
                    Some(_) => return Err(pack_error(pack, format!("{} is corrupt", rel))),
                    None => return Err(pack_error(pack, format!("{} is not in the manifest", rel))),
                }
                target.create_file(&rel, &data, mode)?;
            }
            other => debug!("Skipping {:?} entry {}", other, rel),
        }
    }

    target.finish()?;
    manifest.ok_or_else(|| pack_error(pack, "missing MANIFEST.json"))
}

/// Extract the payload of `pack` into the directory `dest`
pub fn extract(pack: &Path, dest: &Path, include: &[String]) -> Result<Manifest> {
    let mut target = DirectoryFilesystem::new(dest)?;
    unpack_into(pack, &mut target, include)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::PackageInfo;
    use tempfile::TempDir;

    /// Write a pack for `package` holding `files` (path, content) into `dir`
    pub(crate) fn write_test_pack(dir: &Path, package: &PackageInfo, files: &[(&str, &str)]) -> PathBuf {
        let root = dir.join(format!("tree-{}", package.name));
        for (path, content) in files {
            let host = root.join(path);
            fs::create_dir_all(host.parent().unwrap()).unwrap();
            fs::write(host, content).unwrap();
        }
        fs::create_dir_all(&root).unwrap();
        let manifest = Manifest {
            name: package.name.clone(),
            publisher: package.publisher.clone(),
            version: package.version.clone(),
            pack_type: package.pack_type.as_str().to_string(),
            platform: "linux".to_string(),
            arch: "amd64".to_string(),
            options: Some(package.options.clone()),
            commands: Vec::new(),
            files: Vec::new(),
        };
        write_pack(&root, &PathFilter::default(), manifest, &dir.join("packs"), None).unwrap()
    }

    fn manifest(name: &str) -> Manifest {
        Manifest {
            name: name.to_string(),
            publisher: "acme".to_string(),
            version: "1.0.0".to_string(),
            pack_type: "ingredient".to_string(),
            platform: "linux".to_string(),
            arch: "amd64".to_string(),
            options: None,
            commands: Vec::new(),
            files: Vec::new(),
        }
    }

    fn tree(dir: &Path) -> PathBuf {
        let root = dir.join("install");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("include")).unwrap();
        fs::write(root.join("bin/tool"), "tool").unwrap();
        fs::write(root.join("include/tool.h"), "header").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(root.join("bin/tool"), fs::Permissions::from_mode(0o775)).unwrap();
            std::os::unix::fs::symlink("tool", root.join("bin/alias")).unwrap();
        }
        root
    }

    #[test]
    fn test_write_and_extract() {
        let dir = TempDir::new().unwrap();
        let root = tree(dir.path());
        let pack = write_pack(&root, &PathFilter::default(), manifest("tool"), dir.path(), None).unwrap();

        let name = pack.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("tool-linux-amd64-1.0.0-"));
        assert!(name.ends_with(".pack"));

        let read = read_manifest(&pack).unwrap();
        assert_eq!(read.pack_type().unwrap(), PackType::Ingredient);
        let tool = read.files.iter().find(|f| f.path == "bin/tool").unwrap();
        assert_eq!(tool.sha256, sha256(b"tool"));
        assert_eq!(tool.size, 4);

        let out = dir.path().join("out");
        extract(&pack, &out, &[]).unwrap();
        assert_eq!(fs::read_to_string(out.join("include/tool.h")).unwrap(), "header");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(tool.mode, 0o755);
            let mode = fs::metadata(out.join("bin/tool")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            assert_eq!(fs::read_link(out.join("bin/alias")).unwrap(), PathBuf::from("tool"));
        }
    }

    #[test]
    fn test_pack_is_reproducible() {
        let dir = TempDir::new().unwrap();
        let root = tree(dir.path());
        let key = SigningKeyPair::generate();
        let first = write_pack(&root, &PathFilter::default(), manifest("tool"), &dir.path().join("a"), Some(&key)).unwrap();
        let second = write_pack(&root, &PathFilter::default(), manifest("tool"), &dir.path().join("b"), Some(&key)).unwrap();
        assert_eq!(first.file_name(), second.file_name());
        assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
    }

    #[test]
    fn test_filters_apply_on_pack_and_extract() {
        let dir = TempDir::new().unwrap();
        let root = tree(dir.path());
        let filter = PathFilter::new(&["include"]).unwrap();
        let pack = write_pack(&root, &filter, manifest("headers"), dir.path(), None).unwrap();
        let read = read_manifest(&pack).unwrap();
        assert_eq!(read.files.len(), 1);
        assert_eq!(read.files[0].path, "include/tool.h");

        let full = write_pack(&root, &PathFilter::default(), manifest("full"), dir.path(), None).unwrap();
        let out = dir.path().join("bin-only");
        extract(&full, &out, &["bin/tool".to_string()]).unwrap();
        assert!(out.join("bin/tool").exists());
        assert!(!out.join("include/tool.h").exists());
    }

    #[test]
    fn test_signature_verification() {
        let dir = TempDir::new().unwrap();
        let root = tree(dir.path());
        let key = SigningKeyPair::generate();
        let signed = write_pack(&root, &PathFilter::default(), manifest("tool"), dir.path(), Some(&key)).unwrap();
        verify(&signed, Some(&key.public_key_base64())).unwrap();
        let other = SigningKeyPair::generate();
        assert!(verify(&signed, Some(&other.public_key_base64())).is_err());

        let unsigned = write_pack(&root, &PathFilter::default(), manifest("plain"), dir.path(), None).unwrap();
        assert!(verify(&unsigned, None).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.pack");
        fs::write(&bogus, "nope").unwrap();
        assert!(matches!(read_manifest(&bogus), Err(Error::PackError(_))));
        assert!(extract(&bogus, &dir.path().join("out"), &[]).is_err());
    }
}
