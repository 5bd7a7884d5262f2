// src/policy/key.rs

//! Policy keys, access masks and inode resolution

use std::path::{Path, PathBuf};

pub const MASK_READ: u32 = 1;
pub const MASK_WRITE: u32 = 2;
pub const MASK_EXEC: u32 = 4;
pub const MASK_ALL: u32 = MASK_READ | MASK_WRITE | MASK_EXEC;

/// Directory rule applies to the directory's immediate children only
pub const DIR_CHILDREN_ONLY: u32 = 1;
/// Directory rule applies to every descendant
pub const DIR_RECURSIVE: u32 = 2;

/// Maximum ancestor levels walked when matching directory rules
pub const MAX_ANCESTOR_DEPTH: usize = 32;

/// File rules are indexed by the cgroup of the accessing task and the
/// (device, inode) of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
}

impl PolicyKey {
    pub fn new(cgroup_id: u64, dev: u64, ino: u64) -> Self {
        Self { cgroup_id, dev, ino }
    }
}

/// `true` when every bit of `required` is in `allowed`
pub fn mask_allows(allowed: u32, required: u32) -> bool {
    required & !allowed == 0
}

/// Render a mask as `rwx` style text
pub fn mask_to_string(mask: u32) -> String {
    let mut out = String::with_capacity(3);
    out.push(if mask & MASK_READ != 0 { 'r' } else { '-' });
    out.push(if mask & MASK_WRITE != 0 { 'w' } else { '-' });
    out.push(if mask & MASK_EXEC != 0 { 'x' } else { '-' });
    out
}

/// Parse `r`, `rw`, `rx`, `rwx` (any order) into a mask
pub fn parse_mask(text: &str) -> Option<u32> {
    let mut mask = 0;
    for c in text.chars() {
        mask |= match c {
            'r' | 'R' => MASK_READ,
            'w' | 'W' => MASK_WRITE,
            'x' | 'X' => MASK_EXEC,
            '-' => 0,
            _ => return None,
        };
    }
    Some(mask)
}

/// Maps paths to (device, inode) pairs
///
/// The evaluator never touches the filesystem directly, so tests can supply
/// a synthetic tree.
pub trait FileResolver {
    /// Identity of `path`, or `None` if it does not exist
    fn identity(&self, path: &Path) -> Option<(u64, u64)>;
}

/// Resolver backed by `stat(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct FsResolver;

#[cfg(unix)]
impl FileResolver for FsResolver {
    fn identity(&self, path: &Path) -> Option<(u64, u64)> {
        use std::os::unix::fs::MetadataExt;
        std::fs::symlink_metadata(path)
            .ok()
            .map(|m| (m.dev(), m.ino()))
    }
}

#[cfg(not(unix))]
impl FileResolver for FsResolver {
    fn identity(&self, path: &Path) -> Option<(u64, u64)> {
        // No inode numbers; use a path hash so rules still key consistently
        std::fs::symlink_metadata(path)
            .ok()
            .map(|_| (0, crate::hash::fnv1a_64(path.to_string_lossy().as_bytes())))
    }
}

/// Ancestors of `path` from its parent upwards, at most `MAX_ANCESTOR_DEPTH`
pub fn ancestors(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    path.ancestors()
        .skip(1)
        .filter(|p| !p.as_os_str().is_empty())
        .take(MAX_ANCESTOR_DEPTH)
        .map(Path::to_path_buf)
}
