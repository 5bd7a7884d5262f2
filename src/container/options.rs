// src/container/options.rs

//! Options passed to `ContainerRuntime::create`

use crate::container::limits::ResourceLimits;
use crate::layers::Layer;
use crate::policy::Policy;
use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::time::Duration;

/// Features requested from a container backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Private rootfs composed from layers
    pub const FILESYSTEM: Capabilities = Capabilities(1 << 0);
    /// Network access; without it the payload gets an empty namespace
    pub const NETWORK: Capabilities = Capabilities(1 << 1);
    /// Resource limits through cgroups or a job object
    pub const CGROUPS: Capabilities = Capabilities(1 << 2);
    /// Install and enforce the attached policy
    pub const POLICY: Capabilities = Capabilities(1 << 3);
    /// Run in a user namespace as an unprivileged user
    pub const USERNS: Capabilities = Capabilities(1 << 4);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Capabilities) {
        self.0 &= !other.0;
    }

    pub fn names(&self) -> Vec<&'static str> {
        [
            (Self::FILESYSTEM, "filesystem"),
            (Self::NETWORK, "network"),
            (Self::CGROUPS, "cgroups"),
            (Self::POLICY, "policy"),
            (Self::USERNS, "userns"),
        ]
        .into_iter()
        .filter(|(cap, _)| self.contains(*cap))
        .map(|(_, name)| name)
        .collect()
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self {
        Capabilities(self.0 | rhs.0)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Addressing for a container with its own network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub container_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    /// VM switch a Windows guest NIC is bound to
    pub switch_name: Option<String>,
}

/// Sizing of a VM-backed guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmResources {
    pub memory_mb: u32,
    pub cpu_count: u32,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_count: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IsolationMode {
    /// Hyper-V utility VM
    #[default]
    Hypervisor,
    /// Shared kernel (Windows Server containers)
    Process,
}

impl IsolationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationMode::Hypervisor => "hyperv",
            IsolationMode::Process => "process",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowsRootfsType {
    /// Windows guest booting a VHDX chain
    #[default]
    WindowsVm,
    /// Linux guest (LCOW) booted from a kernel and initrd
    Lcow,
    /// ext4.vhdx imported from a WSL distribution
    Wsl,
}

/// Knobs that only apply to Windows hosts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowsGuest {
    pub rootfs_type: WindowsRootfsType,
    /// Guest OS version, e.g. `10.0.20348`
    pub version: Option<String>,
    pub lcow_kernel: Option<PathBuf>,
    pub lcow_initrd: Option<PathBuf>,
    pub isolation: IsolationMode,
}

/// Everything a backend needs to create a container
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub capabilities: Capabilities,
    pub layers: Vec<Layer>,
    pub policy: Option<Policy>,
    pub network: Option<NetworkConfig>,
    pub vm: VmResources,
    pub limits: ResourceLimits,
    pub windows: WindowsGuest,
    /// Staging directory the rootfs is composed into
    pub staging_dir: PathBuf,
    pub hostname: String,
    /// Identity the payload runs as inside the container
    pub uid: u32,
    pub gid: u32,
    /// Upper bound on a single `wait`
    pub wait_timeout: Option<Duration>,
}

impl ContainerOptions {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            capabilities: Capabilities::FILESYSTEM,
            layers: Vec::new(),
            policy: None,
            network: None,
            vm: VmResources::default(),
            limits: ResourceLimits::default(),
            windows: WindowsGuest::default(),
            staging_dir: staging_dir.into(),
            hostname: "bake".to_string(),
            uid: current_uid(),
            gid: current_gid(),
            wait_timeout: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_layers(mut self, layers: Vec<Layer>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.capabilities.insert(Capabilities::POLICY);
        self.policy = Some(policy);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        if !limits.is_unlimited() {
            self.capabilities.insert(Capabilities::CGROUPS);
        }
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.capabilities.insert(Capabilities::NETWORK);
        self.network = Some(network);
        self
    }

    pub fn has(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

#[cfg(unix)]
fn current_gid() -> u32 {
    nix::unistd::getgid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

#[cfg(not(unix))]
fn current_gid() -> u32 {
    0
}
