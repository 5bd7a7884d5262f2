// src/policy/mod.rs

//! Access policy for confined payloads
//!
//! A [`Policy`] is written in terms of guest paths, basename patterns,
//! socket rules and a mount profile. Installing it for a container resolves
//! the paths against the rootfs and produces the keyed maps the
//! [`PolicyEvaluator`] decides over. On Linux the file rules are also
//! handed to Landlock in the container child.

pub mod basename;
pub mod evaluator;
pub mod events;
pub mod key;
#[cfg(target_os = "linux")]
pub mod landlock;
pub mod mount;
pub mod network;

use crate::error::{Error, Result};
use basename::BasenameRule;
use evaluator::{FileAccess, OpenMode, PolicyMaps};
use events::{DenyEventRing, Hook};
use key::{
    DIR_CHILDREN_ONLY, DIR_RECURSIVE, FileResolver, MASK_EXEC, MASK_READ, MASK_WRITE, PolicyKey,
};
use mount::{MountPolicyMap, MountProfile, MountRequest};
use network::{AF_INET, AF_INET6, NetworkMaps, NetworkRule, SOCK_DGRAM, SOCK_STREAM, SocketAccess};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        *self == Decision::Allow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathScope {
    /// The path itself
    File,
    /// Immediate children of a directory
    Children,
    /// Every descendant of a directory
    Recursive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    /// Guest path
    pub path: PathBuf,
    pub mask: u32,
    pub scope: PathScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasenameSpec {
    /// Guest path of the parent directory
    pub parent: PathBuf,
    pub rule: BasenameRule,
}

/// Declarative policy attached to a container
#[derive(Debug, Clone, Default)]
pub struct Policy {
    paths: Vec<PathRule>,
    basenames: Vec<BasenameSpec>,
    network: Vec<NetworkRule>,
    mount_profile: Option<MountProfile>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy for build steps: system directories readable and executable,
    /// the chef tree and scratch space writable, mounts refused
    pub fn build_default(allow_network: bool) -> Self {
        let mut policy = Self::new();
        for dir in ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc", "/opt"] {
            policy.allow_path(dir, MASK_READ | MASK_EXEC, PathScope::Recursive);
        }
        for dir in ["/chef", "/tmp", "/var/tmp"] {
            policy.allow_path(dir, MASK_READ | MASK_WRITE | MASK_EXEC, PathScope::Recursive);
        }
        policy.allow_path("/proc", MASK_READ, PathScope::Recursive);
        policy.allow_path("/sys", MASK_READ, PathScope::Recursive);
        policy.allow_path("/dev", MASK_READ | MASK_WRITE, PathScope::Children);

        if allow_network {
            for family in [AF_INET, AF_INET6] {
                for sock_type in [SOCK_STREAM, SOCK_DGRAM] {
                    policy.allow_network(NetworkRule::allow_any(family, sock_type));
                }
            }
        }
        policy.set_mount_profile(MountProfile::deny_all());
        policy
    }

    pub fn allow_path(&mut self, path: impl Into<PathBuf>, mask: u32, scope: PathScope) -> &mut Self {
        self.paths.push(PathRule {
            path: path.into(),
            mask,
            scope,
        });
        self
    }

    pub fn allow_basename(
        &mut self,
        parent: impl Into<PathBuf>,
        pattern: &str,
        mask: u32,
    ) -> Result<&mut Self> {
        let rule = BasenameRule::parse(pattern, mask)?;
        self.basenames.push(BasenameSpec {
            parent: parent.into(),
            rule,
        });
        Ok(self)
    }

    pub fn allow_network(&mut self, rule: NetworkRule) -> &mut Self {
        self.network.push(rule);
        self
    }

    pub fn set_mount_profile(&mut self, profile: MountProfile) -> &mut Self {
        self.mount_profile = Some(profile);
        self
    }

    pub fn path_rules(&self) -> &[PathRule] {
        &self.paths
    }

    pub fn basename_rules(&self) -> &[BasenameSpec] {
        &self.basenames
    }

    pub fn network_rules(&self) -> &[NetworkRule] {
        &self.network
    }

    pub fn mount_profile(&self) -> Option<&MountProfile> {
        self.mount_profile.as_ref()
    }

    /// Resolve the path rules under `root` into keyed maps; paths missing
    /// from the rootfs are skipped
    pub fn compile(
        &self,
        cgroup_id: u64,
        root: &Path,
        resolver: &dyn FileResolver,
    ) -> Result<PolicyMaps> {
        let mut maps = PolicyMaps::default();
        for rule in &self.paths {
            let host = guest_to_host(root, &rule.path);
            let Some((dev, ino)) = resolver.identity(&host) else {
                debug!("Policy path {} not present, skipping", rule.path.display());
                continue;
            };
            let key = PolicyKey::new(cgroup_id, dev, ino);
            match rule.scope {
                PathScope::File => maps.insert_file(key, rule.mask),
                PathScope::Children => maps.insert_dir(key, rule.mask, DIR_CHILDREN_ONLY),
                PathScope::Recursive => maps.insert_dir(key, rule.mask, DIR_RECURSIVE),
            }
        }
        for spec in &self.basenames {
            let host = guest_to_host(root, &spec.parent);
            let Some((dev, ino)) = resolver.identity(&host) else {
                debug!("Basename parent {} not present, skipping", spec.parent.display());
                continue;
            };
            maps.insert_basename(PolicyKey::new(cgroup_id, dev, ino), spec.rule.clone())?;
        }
        Ok(maps)
    }
}

const DEFAULT_GUEST_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Map a guest path onto the host rootfs, dropping `..` components
pub fn guest_to_host(root: &Path, guest: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in guest.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

/// Installed policy for one container
pub struct PolicyEvaluator {
    cgroup_id: u64,
    root: PathBuf,
    maps: PolicyMaps,
    network: NetworkMaps,
    mounts: MountPolicyMap,
    events: Arc<DenyEventRing>,
    resolver: Box<dyn FileResolver + Send + Sync>,
}

impl PolicyEvaluator {
    pub fn install(
        policy: &Policy,
        cgroup_id: u64,
        root: &Path,
        resolver: Box<dyn FileResolver + Send + Sync>,
    ) -> Result<Self> {
        let maps = policy.compile(cgroup_id, root, resolver.as_ref())?;
        let mut network = NetworkMaps::default();
        network.install(cgroup_id, policy.network_rules());
        let mut mounts = MountPolicyMap::default();
        if let Some(profile) = policy.mount_profile() {
            mounts.install(cgroup_id, profile)?;
        }
        debug!(
            "Installed policy for cgroup {}: {} inode, {} directory, {} basename entries",
            cgroup_id,
            maps.policy_map.len(),
            maps.dir_policy_map.len(),
            maps.basename_policy_map.len()
        );
        Ok(Self {
            cgroup_id,
            root: root.to_path_buf(),
            maps,
            network,
            mounts,
            events: Arc::new(DenyEventRing::default()),
            resolver,
        })
    }

    pub fn cgroup_id(&self) -> u64 {
        self.cgroup_id
    }

    pub fn events(&self) -> Arc<DenyEventRing> {
        Arc::clone(&self.events)
    }

    pub fn maps(&self) -> &PolicyMaps {
        &self.maps
    }

    /// Decide `open(2)` of a guest path with the given flags
    pub fn check_open(&self, guest: &Path, flags: i32, comm: &str) -> Decision {
        self.check_hook(Hook::FileOpen, guest, OpenMode::from_flags(flags), comm)
    }

    pub fn check_exec(&self, guest: &Path, comm: &str) -> Decision {
        self.check_hook(Hook::BprmCheck, guest, OpenMode::ReadOnly, comm)
    }

    pub fn check_hook(&self, hook: Hook, guest: &Path, mode: OpenMode, comm: &str) -> Decision {
        let host = guest_to_host(&self.root, guest);
        evaluator::check_hook(
            &self.maps,
            self.resolver.as_ref(),
            &self.events,
            self.cgroup_id,
            hook,
            &host,
            mode,
            comm,
        )
    }

    pub fn check_access(&self, guest: &Path, required: u32, comm: &str) -> Decision {
        let host = guest_to_host(&self.root, guest);
        evaluator::check_file(
            &self.maps,
            self.resolver.as_ref(),
            &self.events,
            FileAccess {
                cgroup_id: self.cgroup_id,
                path: &host,
                required,
                hook: Hook::FileOpen,
                comm,
            },
        )
    }

    /// Find `program` the way `execvp` would, using the guest's `PATH`
    pub fn resolve_program(&self, program: &str, path_var: Option<&str>, cwd: &Path) -> Option<PathBuf> {
        if program.contains('/') {
            let path = Path::new(program);
            return Some(if path.is_absolute() {
                path.to_path_buf()
            } else {
                cwd.join(path)
            });
        }
        path_var
            .unwrap_or(DEFAULT_GUEST_PATH)
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(program))
            .find(|guest| guest_to_host(&self.root, guest).is_file())
    }

    /// Refuse a spawn whose program may not be executed or whose working
    /// directory may not be read; the refusal is also recorded as an event
    ///
    /// Only paths present in the staged rootfs are decided here. Host
    /// directories bound in by the container child are left to Landlock.
    pub fn check_spawn(&self, program: &str, path_var: Option<&str>, cwd: &Path) -> Result<()> {
        let comm = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string());
        let staged = |guest: &Path| guest_to_host(&self.root, guest).exists();
        if staged(cwd) && !self.check_access(cwd, MASK_READ, &comm).is_allowed() {
            return Err(Error::PolicyDenied {
                hook: Hook::FileOpen.as_str().to_string(),
                target: cwd.display().to_string(),
            });
        }
        // a program that cannot be found fails at exec instead
        if let Some(guest) = self
            .resolve_program(program, path_var, cwd)
            .filter(|guest| staged(guest))
        {
            if !self.check_exec(&guest, &comm).is_allowed() {
                return Err(Error::PolicyDenied {
                    hook: Hook::BprmCheck.as_str().to_string(),
                    target: guest.display().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn check_socket(&self, hook: Hook, access: &SocketAccess<'_>, comm: &str) -> Decision {
        self.network
            .check(self.cgroup_id, hook, access, comm, &self.events)
    }

    pub fn check_mount(&self, request: &MountRequest, comm: &str) -> Decision {
        self.mounts
            .check(self.cgroup_id, request, comm, &self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use key::FsResolver;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_guest_to_host() {
        let root = Path::new("/srv/root");
        assert_eq!(
            guest_to_host(root, Path::new("/chef/../etc/passwd")),
            PathBuf::from("/srv/root/chef/etc/passwd")
        );
        assert_eq!(guest_to_host(root, Path::new("/")), PathBuf::from("/srv/root"));
    }

    #[cfg(unix)]
    #[test]
    fn test_build_default_policy() {
        let dir = TempDir::new().unwrap();
        for sub in ["usr/bin", "chef/build", "etc"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        fs::write(dir.path().join("usr/bin/cc"), "").unwrap();
        fs::write(dir.path().join("etc/hosts"), "").unwrap();

        let policy = Policy::build_default(false);
        let evaluator =
            PolicyEvaluator::install(&policy, 9, dir.path(), Box::new(FsResolver)).unwrap();

        assert!(evaluator.check_exec(Path::new("/usr/bin/cc"), "make").is_allowed());
        assert!(!evaluator.check_open(Path::new("/etc/hosts"), 1, "sh").is_allowed());
        assert!(
            evaluator
                .check_hook(
                    Hook::InodeCreate,
                    Path::new("/chef/build/out.o"),
                    OpenMode::ReadOnly,
                    "cc"
                )
                .is_allowed()
        );
        assert!(
            !evaluator
                .check_mount(&MountRequest::new("proc", "/proc", "proc", "", 0), "mount")
                .is_allowed()
        );
        let access = SocketAccess::Inet {
            family: AF_INET,
            sock_type: SOCK_STREAM,
            protocol: 6,
            dest: None,
        };
        assert!(
            !evaluator
                .check_socket(Hook::SocketCreate, &access, "curl")
                .is_allowed()
        );
        assert_eq!(evaluator.events().drain().len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_check_spawn_records_denials() {
        let dir = TempDir::new().unwrap();
        for sub in ["usr/bin", "chef/build", "srv/tools"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        fs::write(dir.path().join("usr/bin/make"), "").unwrap();
        fs::write(dir.path().join("srv/tools/fetch"), "").unwrap();

        let policy = Policy::build_default(false);
        let evaluator =
            PolicyEvaluator::install(&policy, 9, dir.path(), Box::new(FsResolver)).unwrap();
        let build = Path::new("/chef/build");

        assert_eq!(
            evaluator.resolve_program("make", Some("/srv/tools:/usr/bin"), build),
            Some(PathBuf::from("/usr/bin/make"))
        );
        evaluator.check_spawn("make", Some("/usr/bin"), build).unwrap();
        // not staged, so left to the kernel
        evaluator.check_spawn("/bin/sh", None, build).unwrap();

        let err = evaluator
            .check_spawn("fetch", Some("/srv/tools"), build)
            .unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { ref hook, .. } if hook == "bprm_check_security"));
        let err = evaluator
            .check_spawn("/usr/bin/make", None, Path::new("/srv/tools"))
            .unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { ref hook, .. } if hook == "file_open"));

        let events = evaluator.events().drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].comm, "fetch");
        assert_eq!(events[0].name, "fetch");
        assert_eq!(events[1].name, "tools");
    }
}
