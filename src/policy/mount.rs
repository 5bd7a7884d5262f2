// src/policy/mount.rs

//! Mount policy
//!
//! A profile is an ordered list of rules; the first rule matching a mount
//! request decides it, otherwise the profile default applies. Profiles are
//! stored per cgroup in serialized form, the same bytes a kernel-side
//! enforcer would read.

use crate::error::{Error, Result};
use crate::policy::Decision;
use crate::policy::events::{DenyEvent, DenyEventRing, Hook, truncate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bound for source, fstype and options strings
pub const MOUNT_STR_MAX: usize = 256;
/// Bound for the resolved target path
pub const MOUNT_PATH_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: String,
    pub flags: u64,
}

impl MountRequest {
    /// Build a request, truncating each string to its bound
    pub fn new(source: &str, target: &str, fstype: &str, options: &str, flags: u64) -> Self {
        Self {
            source: truncate(source, MOUNT_STR_MAX),
            target: truncate(target, MOUNT_PATH_MAX),
            fstype: truncate(fstype, MOUNT_STR_MAX),
            options: truncate(options, MOUNT_STR_MAX),
            flags,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountAction {
    #[default]
    Allow,
    Deny,
}

/// One rule; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRule {
    /// Glob over the mount source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Glob over the target path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    /// Rule matches when any of these flag bits is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags_any: Option<u64>,
    pub action: MountAction,
}

impl MountRule {
    fn matches(&self, request: &MountRequest) -> bool {
        fn glob(pattern: &Option<String>, value: &str) -> bool {
            match pattern {
                None => true,
                Some(p) => glob::Pattern::new(p).is_ok_and(|p| p.matches(value)),
            }
        }
        glob(&self.source, &request.source)
            && glob(&self.target, &request.target)
            && self.fstype.as_ref().is_none_or(|f| *f == request.fstype)
            && self.flags_any.is_none_or(|f| request.flags & f != 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountProfile {
    #[serde(default)]
    pub rules: Vec<MountRule>,
    #[serde(default)]
    pub default_action: MountAction,
}

impl MountProfile {
    /// A profile that refuses every mount
    pub fn deny_all() -> Self {
        Self {
            rules: Vec::new(),
            default_action: MountAction::Deny,
        }
    }

    pub fn evaluate(&self, request: &MountRequest) -> MountAction {
        self.rules
            .iter()
            .find(|r| r.matches(request))
            .map(|r| r.action)
            .unwrap_or(self.default_action)
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            for pattern in [&rule.source, &rule.target].into_iter().flatten() {
                glob::Pattern::new(pattern).map_err(|e| {
                    Error::validation("mount rule", format!("bad pattern '{pattern}': {e}"))
                })?;
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serialized profiles keyed by cgroup id
#[derive(Debug, Clone, Default)]
pub struct MountPolicyMap {
    profiles: HashMap<u64, Vec<u8>>,
}

impl MountPolicyMap {
    pub fn install(&mut self, cgroup_id: u64, profile: &MountProfile) -> Result<()> {
        profile.validate()?;
        self.profiles.insert(cgroup_id, profile.to_bytes()?);
        Ok(())
    }

    pub fn remove(&mut self, cgroup_id: u64) {
        self.profiles.remove(&cgroup_id);
    }

    /// Decide a mount; tasks without a profile are allowed
    pub fn check(
        &self,
        cgroup_id: u64,
        request: &MountRequest,
        comm: &str,
        events: &DenyEventRing,
    ) -> Decision {
        let Some(bytes) = self.profiles.get(&cgroup_id) else {
            return Decision::Allow;
        };
        // An unreadable profile fails closed
        let action = MountProfile::from_bytes(bytes)
            .map(|p| p.evaluate(request))
            .unwrap_or(MountAction::Deny);

        match action {
            MountAction::Allow => Decision::Allow,
            MountAction::Deny => {
                events.emit(DenyEvent::new(
                    cgroup_id,
                    (0, 0),
                    0,
                    Hook::Mount,
                    comm,
                    &request.target,
                ));
                Decision::Deny
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str, fstype: &str) -> MountRequest {
        MountRequest::new("none", target, fstype, "", 0)
    }

    #[test]
    fn test_first_rule_wins() {
        let profile = MountProfile {
            rules: vec![
                MountRule {
                    target: Some("/chef/**".to_string()),
                    fstype: Some("tmpfs".to_string()),
                    action: MountAction::Allow,
                    ..Default::default()
                },
                MountRule {
                    target: Some("/chef/**".to_string()),
                    action: MountAction::Deny,
                    ..Default::default()
                },
            ],
            default_action: MountAction::Allow,
        };
        assert_eq!(profile.evaluate(&request("/chef/build", "tmpfs")), MountAction::Allow);
        assert_eq!(profile.evaluate(&request("/chef/build", "ext4")), MountAction::Deny);
        assert_eq!(profile.evaluate(&request("/mnt", "ext4")), MountAction::Allow);
    }

    #[test]
    fn test_map_check_and_events() {
        let mut map = MountPolicyMap::default();
        let events = DenyEventRing::new(4);
        assert_eq!(
            map.check(5, &request("/x", "proc"), "mount", &events),
            Decision::Allow
        );

        map.install(5, &MountProfile::deny_all()).unwrap();
        assert_eq!(
            map.check(5, &request("/x", "proc"), "mount", &events),
            Decision::Deny
        );
        assert_eq!(
            map.check(6, &request("/x", "proc"), "mount", &events),
            Decision::Allow
        );
        let drained = events.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "/x");
    }

    #[test]
    fn test_request_bounds() {
        let long = "a".repeat(2000);
        let req = MountRequest::new(&long, &long, &long, &long, 0);
        assert_eq!(req.source.len(), MOUNT_STR_MAX);
        assert_eq!(req.target.len(), MOUNT_PATH_MAX);
    }

    #[test]
    fn test_profile_serialization() {
        let profile = MountProfile {
            rules: vec![MountRule {
                flags_any: Some(1),
                action: MountAction::Deny,
                ..Default::default()
            }],
            default_action: MountAction::Allow,
        };
        let bytes = profile.to_bytes().unwrap();
        assert_eq!(MountProfile::from_bytes(&bytes).unwrap(), profile);
        assert!(
            MountProfile {
                rules: vec![MountRule {
                    target: Some("[".to_string()),
                    ..Default::default()
                }],
                default_action: MountAction::Allow,
            }
            .validate()
            .is_err()
        );
    }
}
