// src/ingredients.rs

//! Ingredient store
//!
//! Ingredients are packs published by someone else: toolchains, libraries
//! and content. They are keyed by (publisher, name, version, channel, arch,
//! platform) and cached under
//! `~/.chef/store/<publisher>/<name>/<platform>/<arch>/<channel>/<version>.pack`.
//!
//! Packs come from one or more [`IngredientSource`]s tried in order. An
//! ingredient without a version resolves to the newest version any source
//! lists for its channel.

use crate::error::{Error, Result};
use crate::packager::artifact::{self, Manifest};
use crate::recipe::{Ingredient, IngredientRef, Target};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for resolve requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for pack downloads
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub fn default_store_dir() -> PathBuf {
    crate::config::chef_dir().join("store")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngredientKey {
    pub publisher: String,
    pub name: String,
    pub version: String,
    pub channel: String,
    pub arch: String,
    pub platform: String,
}

impl IngredientKey {
    /// Path of this ingredient below a store root
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.publisher)
            .join(&self.name)
            .join(&self.platform)
            .join(&self.arch)
            .join(&self.channel)
            .join(format!("{}.pack", self.version))
    }
}

impl fmt::Display for IngredientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}/{} ({}/{})",
            self.publisher, self.name, self.channel, self.version, self.platform, self.arch
        )
    }
}

/// What to look up: everything but a possibly missing version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngredientQuery {
    pub publisher: String,
    pub name: String,
    pub channel: String,
    pub version: Option<String>,
    pub arch: String,
    pub platform: String,
}

impl IngredientQuery {
    pub fn from_ingredient(ingredient: &Ingredient, target: &Target) -> Result<Self> {
        let (publisher, name) = ingredient
            .publisher()
            .zip(ingredient.package())
            .ok_or_else(|| {
                Error::validation(
                    format!("ingredient '{}'", ingredient.name),
                    "name must be publisher/name",
                )
            })?;
        Ok(Self {
            publisher: publisher.to_string(),
            name: name.to_string(),
            channel: ingredient.channel.clone(),
            version: ingredient.version.clone(),
            arch: target.arch.clone(),
            platform: target.platform.clone(),
        })
    }

    /// Toolchains run on the build machine, so they use the host target
    pub fn from_toolchain(toolchain: &IngredientRef) -> Self {
        let host = Target::host();
        Self {
            publisher: toolchain.publisher.clone(),
            name: toolchain.name.clone(),
            channel: toolchain.channel.clone(),
            version: toolchain.version.clone(),
            arch: host.arch,
            platform: host.platform,
        }
    }

    fn with_version(&self, version: String) -> IngredientKey {
        IngredientKey {
            publisher: self.publisher.clone(),
            name: self.name.clone(),
            version,
            channel: self.channel.clone(),
            arch: self.arch.clone(),
            platform: self.platform.clone(),
        }
    }
}

/// Compare dotted versions numerically where both components are numbers
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(['.', '-', '+'])
            .map(str::to_string)
            .collect()
    };
    let (left, right) = (split(a), split(b));
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Somewhere packs can be resolved and fetched from
pub trait IngredientSource: Send + Sync {
    fn name(&self) -> String;

    /// Versions available for the query's channel, in any order
    fn versions(&self, query: &IngredientQuery) -> Result<Vec<String>>;

    /// Write the pack for `key` to `dest`
    fn fetch(&self, key: &IngredientKey, dest: &Path) -> Result<()>;
}

/// A local directory laid out like the store
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn channel_dir(&self, query: &IngredientQuery) -> PathBuf {
        self.root
            .join(&query.publisher)
            .join(&query.name)
            .join(&query.platform)
            .join(&query.arch)
            .join(&query.channel)
    }
}

impl IngredientSource for DirectorySource {
    fn name(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    fn versions(&self, query: &IngredientQuery) -> Result<Vec<String>> {
        let dir = self.channel_dir(query);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "pack") {
                if let Some(stem) = path.file_stem() {
                    versions.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        Ok(versions)
    }

    fn fetch(&self, key: &IngredientKey, dest: &Path) -> Result<()> {
        let source = self.root.join(key.relative_path());
        if !source.is_file() {
            return Err(Error::NotFound(format!("{} in {}", key, self.root.display())));
        }
        fs::copy(&source, dest)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct VersionList {
    versions: Vec<String>,
}

/// An HTTP ingredient index
///
/// `GET <base>/packages/<publisher>/<name>/versions?channel=&platform=&arch=`
/// returns `{"versions": [...]}`; packs are served at the store-relative
/// path below `<base>/packages/`.
pub struct HttpSource {
    base: url::Url,
    client: Client,
    downloads: Client,
}

impl HttpSource {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = url::Url::parse(base)
            .map_err(|e| Error::Usage(format!("invalid ingredient source '{}': {}", base, e)))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let build = |timeout: Duration| {
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::RemoteError(format!("failed to create HTTP client: {}", e)))
        };
        Ok(Self {
            base,
            client: build(REQUEST_TIMEOUT)?,
            downloads: build(DOWNLOAD_TIMEOUT)?,
        })
    }

    fn url(&self, relative: &str) -> Result<url::Url> {
        self.base
            .join(relative)
            .map_err(|e| Error::RemoteError(format!("bad URL {}: {}", relative, e)))
    }
}

impl IngredientSource for HttpSource {
    fn name(&self) -> String {
        self.base.to_string()
    }

    fn versions(&self, query: &IngredientQuery) -> Result<Vec<String>> {
        let url = self.url(&format!("packages/{}/{}/versions", query.publisher, query.name))?;
        let response = self
            .client
            .get(url.clone())
            .query(&[
                ("channel", query.channel.as_str()),
                ("platform", query.platform.as_str()),
                ("arch", query.arch.as_str()),
            ])
            .send()
            .map_err(|e| Error::RemoteError(format!("GET {}: {}", url, e)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::RemoteError(format!("HTTP {} from {}", response.status(), url)));
        }
        let list: VersionList = response
            .json()
            .map_err(|e| Error::RemoteError(format!("bad version list from {}: {}", url, e)))?;
        Ok(list.versions)
    }

    fn fetch(&self, key: &IngredientKey, dest: &Path) -> Result<()> {
        let relative = key.relative_path().to_string_lossy().replace('\\', "/");
        let url = self.url(&format!("packages/{}", relative))?;
        info!("Downloading {}", url);
        let mut response = self
            .downloads
            .get(url.clone())
            .send()
            .map_err(|e| Error::RemoteError(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::RemoteError(format!("HTTP {} from {}", response.status(), url)));
        }
        let mut file = File::create(dest)?;
        response
            .copy_to(&mut file)
            .map_err(|e| Error::RemoteError(format!("download {}: {}", url, e)))?;
        Ok(())
    }
}

/// Local cache of ingredient packs in front of the configured sources
pub struct IngredientStore {
    root: PathBuf,
    sources: Vec<Box<dyn IngredientSource>>,
}

impl IngredientStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: Box<dyn IngredientSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Add a source from a config string: a URL or a directory path
    pub fn with_location(self, location: &str) -> Result<Self> {
        if location.starts_with("http://") || location.starts_with("https://") {
            Ok(self.with_source(Box::new(HttpSource::new(location)?)))
        } else {
            Ok(self.with_source(Box::new(DirectorySource::new(location))))
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &IngredientKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Versions already in the local cache
    fn cached_versions(&self, query: &IngredientQuery) -> Result<Vec<String>> {
        DirectorySource::new(&self.root).versions(query)
    }

    /// Pin a query to a concrete version
    pub fn resolve(&self, query: &IngredientQuery) -> Result<IngredientKey> {
        if let Some(version) = &query.version {
            return Ok(query.with_version(version.clone()));
        }

        let mut versions = Vec::new();
        for source in &self.sources {
            match source.versions(query) {
                Ok(found) => versions.extend(found),
                Err(e) => warn!("Source {} failed to list versions: {}", source.name(), e),
            }
        }
        if versions.is_empty() {
            versions = self.cached_versions(query)?;
        }
        let newest = versions
            .into_iter()
            .max_by(|a, b| compare_versions(a, b))
            .ok_or_else(|| {
                Error::MissingDependency(format!(
                    "no version of {}/{} in channel {} for {}/{}",
                    query.publisher, query.name, query.channel, query.platform, query.arch
                ))
            })?;
        debug!("Resolved {}/{} to {}", query.publisher, query.name, newest);
        Ok(query.with_version(newest))
    }

    /// Make sure the pack for `key` is cached; returns its path
    pub fn fetch(&self, key: &IngredientKey) -> Result<PathBuf> {
        let dest = self.path(key);
        if dest.is_file() {
            debug!("Ingredient cache hit: {}", key);
            return Ok(dest);
        }
        let parent = dest
            .parent()
            .ok_or_else(|| Error::IoError(format!("invalid store path {}", dest.display())))?;
        fs::create_dir_all(parent)?;

        let mut failures = Vec::new();
        for source in &self.sources {
            let tmp = tempfile::NamedTempFile::new_in(parent)?;
            match source
                .fetch(key, tmp.path())
                .and_then(|_| artifact::read_manifest(tmp.path()).map(|_| ()))
            {
                Ok(()) => {
                    tmp.persist(&dest).map_err(|e| e.error)?;
                    info!("Fetched {} from {}", key, source.name());
                    return Ok(dest);
                }
                Err(e) => failures.push(format!("{}: {}", source.name(), e)),
            }
        }
        Err(Error::MissingDependency(if failures.is_empty() {
            format!("{} is not cached and no ingredient source is configured", key)
        } else {
            format!("{} could not be fetched ({})", key, failures.join("; "))
        }))
    }

    /// Resolve and fetch in one go
    pub fn ensure(&self, query: &IngredientQuery) -> Result<(IngredientKey, PathBuf)> {
        let key = self.resolve(query)?;
        let path = self.fetch(&key)?;
        Ok((key, path))
    }

    /// Extract a cached ingredient into `dest`, keeping only `include` paths
    pub fn unpack(&self, key: &IngredientKey, dest: &Path, include: &[String]) -> Result<Manifest> {
        let pack = self.fetch(key)?;
        artifact::extract(&pack, dest, include)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::PackageInfo;
    use crate::packager::artifact::tests::write_test_pack;
    use crate::recipe::{IngredientKind, IngredientOptions, PackType};
    use tempfile::TempDir;

    fn query(version: Option<&str>) -> IngredientQuery {
        IngredientQuery {
            publisher: "acme".to_string(),
            name: "zlib".to_string(),
            channel: "stable".to_string(),
            version: version.map(str::to_string),
            arch: "amd64".to_string(),
            platform: "linux".to_string(),
        }
    }

    /// Publish a pack into a directory source at `version`
    fn publish(source: &Path, scratch: &Path, version: &str) {
        let info = PackageInfo {
            publisher: "acme".to_string(),
            name: "zlib".to_string(),
            version: version.to_string(),
            pack_type: PackType::Ingredient,
            options: IngredientOptions::default(),
        };
        let pack = write_test_pack(
            &scratch.join(version),
            &info,
            &[("include/zlib.h", "hdr"), ("lib/libz.so", version)],
        );
        let key = query(None).with_version(version.to_string());
        let dest = source.join(key.relative_path());
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::copy(pack, dest).unwrap();
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0-rc1", "2.0-rc1"), Ordering::Equal);
    }

    #[test]
    fn test_key_path() {
        let key = query(None).with_version("1.3".to_string());
        assert_eq!(
            key.relative_path(),
            PathBuf::from("acme/zlib/linux/amd64/stable/1.3.pack")
        );
    }

    #[test]
    fn test_resolve_newest_and_fetch() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        publish(&source, &dir.path().join("scratch"), "1.2.13");
        publish(&source, &dir.path().join("scratch"), "1.3.1");

        let store = IngredientStore::new(dir.path().join("store"))
            .with_source(Box::new(DirectorySource::new(&source)));
        let (key, path) = store.ensure(&query(None)).unwrap();
        assert_eq!(key.version, "1.3.1");
        assert!(path.starts_with(dir.path().join("store")));

        let out = dir.path().join("out");
        store
            .unpack(&key, &out, &["lib".to_string()])
            .unwrap();
        assert_eq!(fs::read_to_string(out.join("lib/libz.so")).unwrap(), "1.3.1");
        assert!(!out.join("include/zlib.h").exists());

        // pinned versions skip resolution
        let pinned = store.resolve(&query(Some("1.2.13"))).unwrap();
        assert_eq!(pinned.version, "1.2.13");
    }

    #[test]
    fn test_cached_versions_without_sources() {
        let dir = TempDir::new().unwrap();
        let store_root = dir.path().join("store");
        publish(&store_root, &dir.path().join("scratch"), "0.9");
        let store = IngredientStore::new(&store_root);
        let key = store.resolve(&query(None)).unwrap();
        assert_eq!(key.version, "0.9");
        assert!(store.fetch(&key).is_ok());
    }

    #[test]
    fn test_missing_ingredient() {
        let dir = TempDir::new().unwrap();
        let store = IngredientStore::new(dir.path().join("store"))
            .with_source(Box::new(DirectorySource::new(dir.path().join("empty"))));
        let err = store.resolve(&query(None)).unwrap_err();
        assert!(matches!(err, Error::MissingDependency(_)));
        let err = store.fetch(&query(None).with_version("1.0".to_string())).unwrap_err();
        assert!(matches!(err, Error::MissingDependency(_)));
    }

    #[test]
    fn test_query_from_ingredient() {
        let ingredient = Ingredient {
            name: "acme/zlib".to_string(),
            channel: "stable".to_string(),
            version: None,
            include_filters: Vec::new(),
            kind: IngredientKind::Build,
        };
        let target = Target {
            platform: "linux".to_string(),
            arch: "arm64".to_string(),
        };
        let q = IngredientQuery::from_ingredient(&ingredient, &target).unwrap();
        assert_eq!(q.arch, "arm64");
        assert_eq!(q.publisher, "acme");

        let bad = Ingredient {
            name: "zlib".to_string(),
            ..ingredient
        };
        assert!(IngredientQuery::from_ingredient(&bad, &target).is_err());
    }

    #[test]
    fn test_http_source_rejects_bad_url() {
        assert!(HttpSource::new("not a url").is_err());
        let source = HttpSource::new("https://packs.example.com/index").unwrap();
        assert_eq!(source.name(), "https://packs.example.com/index/");
    }
}
