// src/policy/evaluator.rs

//! File access decisions over (cgroup, inode) keyed maps
//!
//! Lookup order for a file access:
//!
//! 1. tasks outside any container (cgroup 0) are allowed
//! 2. an exact inode rule decides on its own
//! 3. basename rules of the immediate parent directory
//! 4. directory rules of up to 32 ancestors; beyond the immediate parent a
//!    rule must be recursive
//! 5. deny

use crate::error::{Error, Result};
use crate::policy::Decision;
use crate::policy::basename::{BasenameRule, MAX_RULES_PER_PARENT};
use crate::policy::events::{DenyEvent, DenyEventRing, Hook};
use crate::policy::key::{
    DIR_RECURSIVE, FileResolver, MASK_EXEC, MASK_READ, MASK_WRITE, MAX_ANCESTOR_DEPTH, PolicyKey,
    mask_allows,
};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirRule {
    pub allow_mask: u32,
    pub flags: u32,
}

/// Access mode of an `open(2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    /// Decode the O_ACCMODE bits of open flags
    pub fn from_flags(flags: i32) -> Self {
        match flags & 3 {
            1 => OpenMode::WriteOnly,
            2 => OpenMode::ReadWrite,
            _ => OpenMode::ReadOnly,
        }
    }

    pub fn required_mask(&self) -> u32 {
        match self {
            OpenMode::ReadOnly => MASK_READ,
            OpenMode::WriteOnly => MASK_WRITE,
            OpenMode::ReadWrite => MASK_READ | MASK_WRITE,
        }
    }
}

/// Mask a file hook requires, and whether it is checked on the parent
pub fn hook_requirement(hook: Hook, open_mode: OpenMode) -> Option<(u32, bool)> {
    match hook {
        Hook::FileOpen => Some((open_mode.required_mask(), false)),
        Hook::BprmCheck => Some((MASK_EXEC, false)),
        Hook::InodeSetattr | Hook::PathTruncate => Some((MASK_WRITE, false)),
        h if h.checks_parent() => Some((MASK_WRITE, true)),
        _ => None,
    }
}

/// The three file policy maps
#[derive(Debug, Clone, Default)]
pub struct PolicyMaps {
    pub policy_map: HashMap<PolicyKey, u32>,
    pub dir_policy_map: HashMap<PolicyKey, DirRule>,
    pub basename_policy_map: HashMap<PolicyKey, Vec<BasenameRule>>,
}

impl PolicyMaps {
    pub fn insert_file(&mut self, key: PolicyKey, mask: u32) {
        *self.policy_map.entry(key).or_insert(0) |= mask;
    }

    pub fn insert_dir(&mut self, key: PolicyKey, mask: u32, flags: u32) {
        let rule = self.dir_policy_map.entry(key).or_insert(DirRule {
            allow_mask: 0,
            flags: 0,
        });
        rule.allow_mask |= mask;
        rule.flags |= flags;
    }

    pub fn insert_basename(&mut self, parent: PolicyKey, rule: BasenameRule) -> Result<()> {
        let rules = self.basename_policy_map.entry(parent).or_default();
        if rules.len() >= MAX_RULES_PER_PARENT {
            return Err(Error::validation(
                "basename rule",
                format!("more than {MAX_RULES_PER_PARENT} rules for one directory"),
            ));
        }
        rules.push(rule);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.policy_map.is_empty()
            && self.dir_policy_map.is_empty()
            && self.basename_policy_map.is_empty()
    }

    pub fn clear_cgroup(&mut self, cgroup_id: u64) {
        self.policy_map.retain(|k, _| k.cgroup_id != cgroup_id);
        self.dir_policy_map.retain(|k, _| k.cgroup_id != cgroup_id);
        self.basename_policy_map.retain(|k, _| k.cgroup_id != cgroup_id);
    }
}

/// One file access to decide
#[derive(Debug, Clone, Copy)]
pub struct FileAccess<'a> {
    pub cgroup_id: u64,
    pub path: &'a Path,
    pub required: u32,
    pub hook: Hook,
    pub comm: &'a str,
}

/// Decide a file access, emitting a deny event when refused
pub fn check_file(
    maps: &PolicyMaps,
    resolver: &dyn FileResolver,
    events: &DenyEventRing,
    access: FileAccess<'_>,
) -> Decision {
    if access.cgroup_id == 0 {
        return Decision::Allow;
    }
    let cgroup = access.cgroup_id;
    let target = resolver.identity(access.path);

    let deny = || {
        let name = access
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        events.emit(DenyEvent::new(
            cgroup,
            target.unwrap_or((0, 0)),
            access.required,
            access.hook,
            access.comm,
            &name,
        ));
        Decision::Deny
    };
    let decide = |allowed: u32| {
        if mask_allows(allowed, access.required) {
            Decision::Allow
        } else {
            deny()
        }
    };

    if let Some((dev, ino)) = target {
        if let Some(mask) = maps.policy_map.get(&PolicyKey::new(cgroup, dev, ino)) {
            return decide(*mask);
        }
    }

    if let (Some(parent), Some(name)) = (access.path.parent(), access.path.file_name()) {
        if let Some((dev, ino)) = resolver.identity(parent) {
            if let Some(rules) = maps.basename_policy_map.get(&PolicyKey::new(cgroup, dev, ino)) {
                let name = name.as_encoded_bytes();
                if let Some(rule) = rules
                    .iter()
                    .filter(|r| r.token_count() > 0)
                    .find(|r| r.matches(name))
                {
                    return decide(rule.allow_mask);
                }
            }
        }
    }

    for (depth, ancestor) in access
        .path
        .ancestors()
        .skip(1)
        .take(MAX_ANCESTOR_DEPTH)
        .enumerate()
    {
        let Some((dev, ino)) = resolver.identity(ancestor) else {
            continue;
        };
        if let Some(rule) = maps.dir_policy_map.get(&PolicyKey::new(cgroup, dev, ino)) {
            if (depth == 0 || rule.flags & DIR_RECURSIVE != 0)
                && mask_allows(rule.allow_mask, access.required)
            {
                return Decision::Allow;
            }
        }
    }

    deny()
}

/// Decide a file hook; parent-checked hooks evaluate the parent directory
#[allow(clippy::too_many_arguments)]
pub fn check_hook(
    maps: &PolicyMaps,
    resolver: &dyn FileResolver,
    events: &DenyEventRing,
    cgroup_id: u64,
    hook: Hook,
    path: &Path,
    open_mode: OpenMode,
    comm: &str,
) -> Decision {
    let Some((required, on_parent)) = hook_requirement(hook, open_mode) else {
        return Decision::Allow;
    };
    let path = if on_parent {
        path.parent().unwrap_or(path)
    } else {
        path
    };
    check_file(
        maps,
        resolver,
        events,
        FileAccess {
            cgroup_id,
            path,
            required,
            hook,
            comm,
        },
    )
}
