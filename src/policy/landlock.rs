// src/policy/landlock.rs

//! Kernel enforcement of file rules through Landlock
//!
//! Called in the container child after the root pivot, so rule paths are
//! guest paths. Landlock rules are always hierarchical, so children-only
//! directory rules are widened to the whole subtree here; the evaluator
//! still reports the narrower decision. Basename rules are expanded against
//! the parent directory's current entries.
//!
//! When the container shares the host network, TCP bind and connect are
//! restricted to the ports the network rules grant (Landlock ABI 4). A
//! Landlock-restricted process can no longer mount, which is how the
//! `deny_all` mount profile holds; profiles that allow mounts are not
//! honoured inside the payload.

use crate::error::{Error, Result};
use crate::policy::key::{MASK_EXEC, MASK_READ, MASK_WRITE};
use crate::policy::mount::MountAction;
use crate::policy::network::TcpPorts;
use crate::policy::{PathScope, Policy};
use landlock::{
    ABI, Access, AccessFs, AccessNet, BitFlags, NetPort, PathBeneath, PathFd, Ruleset,
    RulesetAttr, RulesetCreatedAttr, RulesetStatus,
};
use std::path::Path;
use tracing::{debug, warn};

const TARGET_ABI: ABI = ABI::V2;

/// How much of the ruleset the running kernel honours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Full,
    Partial,
    None,
}

fn err(e: impl std::fmt::Display) -> Error {
    Error::ContainerError(format!("landlock: {e}"))
}

fn access_for(mask: u32, is_dir: bool) -> BitFlags<AccessFs> {
    let mut access = BitFlags::<AccessFs>::empty();
    if mask & MASK_READ != 0 {
        access |= AccessFs::ReadFile;
        access |= AccessFs::ReadDir;
    }
    if mask & MASK_WRITE != 0 {
        access |= AccessFs::from_write(TARGET_ABI);
    }
    if mask & MASK_EXEC != 0 {
        access |= AccessFs::Execute;
    }
    if is_dir {
        access
    } else {
        access & AccessFs::from_file(TARGET_ABI)
    }
}

fn rule_for(path: &Path, mask: u32) -> Option<PathBeneath<PathFd>> {
    let fd = match PathFd::new(path) {
        Ok(fd) => fd,
        Err(e) => {
            debug!("Skipping landlock rule for {}: {}", path.display(), e);
            return None;
        }
    };
    let access = access_for(mask, path.is_dir());
    if access.is_empty() {
        return None;
    }
    Some(PathBeneath::new(fd, access))
}

/// TCP rights to handle for a port summary; unrestricted operations stay
/// unhandled
fn handled_net(ports: &TcpPorts) -> BitFlags<AccessNet> {
    let mut access = BitFlags::<AccessNet>::empty();
    if ports.bind.is_some() {
        access |= AccessNet::BindTcp;
    }
    if ports.connect.is_some() {
        access |= AccessNet::ConnectTcp;
    }
    access
}

/// Restrict the calling process to the policy's file rules, and to its
/// TCP port rules when `restrict_network` is set
pub fn enforce(policy: &Policy, restrict_network: bool) -> Result<Enforcement> {
    let tcp = restrict_network.then(|| TcpPorts::from_rules(policy.network_rules()));
    let mut attr = Ruleset::default()
        .handle_access(AccessFs::from_all(TARGET_ABI))
        .map_err(err)?;
    if let Some(net) = tcp.as_ref().map(handled_net).filter(|a| !a.is_empty()) {
        attr = attr.handle_access(net).map_err(err)?;
    }
    let mut ruleset = attr.create().map_err(err)?;

    if let Some(tcp) = &tcp {
        for (ports, access) in [(&tcp.bind, AccessNet::BindTcp), (&tcp.connect, AccessNet::ConnectTcp)] {
            for port in ports.iter().flatten() {
                ruleset = ruleset.add_rule(NetPort::new(*port, access)).map_err(err)?;
            }
        }
    }
    if policy
        .mount_profile()
        .is_some_and(|p| {
            p.default_action == MountAction::Allow
                || p.rules.iter().any(|r| r.action == MountAction::Allow)
        })
    {
        warn!("Mount profile exceptions are not enforced; payload mounts are refused");
    }

    for rule in policy.path_rules() {
        if rule.scope == PathScope::Children {
            debug!("Widening children-only rule on {}", rule.path.display());
        }
        if let Some(beneath) = rule_for(&rule.path, rule.mask) {
            ruleset = ruleset.add_rule(beneath).map_err(err)?;
        }
    }

    for spec in policy.basename_rules() {
        let Ok(entries) = std::fs::read_dir(&spec.parent) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if spec.rule.matches(name.as_encoded_bytes()) {
                if let Some(beneath) = rule_for(&entry.path(), spec.rule.allow_mask) {
                    ruleset = ruleset.add_rule(beneath).map_err(err)?;
                }
            }
        }
    }

    let status = ruleset.restrict_self().map_err(err)?;
    let enforcement = match status.ruleset {
        RulesetStatus::FullyEnforced => Enforcement::Full,
        RulesetStatus::PartiallyEnforced => Enforcement::Partial,
        RulesetStatus::NotEnforced => Enforcement::None,
    };
    if enforcement != Enforcement::Full {
        warn!("Landlock policy is {:?} enforced by this kernel", enforcement);
    }
    Ok(enforcement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_for_files_drops_directory_rights() {
        let dir = access_for(MASK_READ | MASK_WRITE, true);
        assert!(dir.contains(AccessFs::ReadDir));
        assert!(dir.contains(AccessFs::MakeDir));

        let file = access_for(MASK_READ | MASK_WRITE, false);
        assert!(file.contains(AccessFs::ReadFile));
        assert!(file.contains(AccessFs::WriteFile));
        assert!(!file.contains(AccessFs::ReadDir));
        assert!(!file.contains(AccessFs::MakeDir));

        assert!(!access_for(MASK_READ, false).contains(AccessFs::Execute));
        assert!(access_for(MASK_EXEC, false).contains(AccessFs::Execute));
    }

    #[test]
    fn test_handled_net_skips_unrestricted_operations() {
        let ports = TcpPorts {
            bind: None,
            connect: Some([443].into()),
        };
        let access = handled_net(&ports);
        assert!(access.contains(AccessNet::ConnectTcp));
        assert!(!access.contains(AccessNet::BindTcp));
        assert!(handled_net(&TcpPorts::default()).is_empty());
    }
}
