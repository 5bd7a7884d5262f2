// src/policy/network.rs

//! Network policy map
//!
//! Socket tuples are keyed by (cgroup, family, type, protocol, address,
//! port); Unix sockets by (cgroup, type, protocol, path, abstract). An
//! all-zero address and port act as the wildcard for a
//! (family, type, protocol) triple.

use crate::policy::Decision;
use crate::policy::events::{DenyEvent, DenyEventRing, Hook};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

pub const NET_PERM_CREATE: u32 = 1 << 0;
pub const NET_PERM_BIND: u32 = 1 << 1;
pub const NET_PERM_CONNECT: u32 = 1 << 2;
pub const NET_PERM_LISTEN: u32 = 1 << 3;
pub const NET_PERM_ACCEPT: u32 = 1 << 4;
pub const NET_PERM_SEND: u32 = 1 << 5;
pub const NET_PERM_ALL: u32 = (1 << 6) - 1;

pub const AF_UNIX: u16 = 1;
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const SOCK_STREAM: u16 = 1;
pub const IPPROTO_TCP: u16 = 6;
pub const SOCK_DGRAM: u16 = 2;

/// Longest Unix socket path kept in a key (sun_path)
pub const UNIX_PATH_MAX: usize = 108;

/// Permission a socket hook requires
pub fn hook_permission(hook: Hook) -> Option<u32> {
    match hook {
        Hook::SocketCreate => Some(NET_PERM_CREATE),
        Hook::SocketBind => Some(NET_PERM_BIND),
        Hook::SocketConnect => Some(NET_PERM_CONNECT),
        Hook::SocketListen => Some(NET_PERM_LISTEN),
        Hook::SocketAccept => Some(NET_PERM_ACCEPT),
        Hook::SocketSendmsg => Some(NET_PERM_SEND),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetKey {
    pub cgroup_id: u64,
    pub family: u16,
    pub sock_type: u16,
    pub protocol: u16,
    /// IPv4 addresses are stored as IPv4-mapped IPv6
    pub addr: [u8; 16],
    pub port: u16,
}

impl NetKey {
    pub fn new(
        cgroup_id: u64,
        family: u16,
        sock_type: u16,
        protocol: u16,
        addr: Option<IpAddr>,
        port: u16,
    ) -> Self {
        Self {
            cgroup_id,
            family,
            sock_type,
            protocol,
            addr: addr.map(encode_addr).unwrap_or([0; 16]),
            port,
        }
    }

    fn wildcard(&self) -> Self {
        Self {
            addr: [0; 16],
            port: 0,
            ..*self
        }
    }

    fn any_port(&self) -> Self {
        Self { port: 0, ..*self }
    }
}

fn encode_addr(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnixKey {
    pub cgroup_id: u64,
    pub sock_type: u16,
    pub protocol: u16,
    pub path: Vec<u8>,
    pub is_abstract: bool,
}

impl UnixKey {
    pub fn new(cgroup_id: u64, sock_type: u16, protocol: u16, path: &str, is_abstract: bool) -> Self {
        let mut bytes = path.as_bytes().to_vec();
        bytes.truncate(UNIX_PATH_MAX);
        Self {
            cgroup_id,
            sock_type,
            protocol,
            path: bytes,
            is_abstract,
        }
    }
}

/// A rule as written in a policy, before it is keyed to a cgroup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkRule {
    Inet {
        family: u16,
        sock_type: u16,
        protocol: u16,
        addr: Option<IpAddr>,
        port: u16,
        perms: u32,
    },
    Unix {
        sock_type: u16,
        protocol: u16,
        path: String,
        is_abstract: bool,
        perms: u32,
    },
}

impl NetworkRule {
    /// Allow every operation for a family/type on any address
    pub fn allow_any(family: u16, sock_type: u16) -> Self {
        NetworkRule::Inet {
            family,
            sock_type,
            protocol: 0,
            addr: None,
            port: 0,
            perms: NET_PERM_ALL,
        }
    }
}

/// TCP ports a rule set grants for bind and connect; `None` means any port
///
/// Landlock can only restrict TCP by port, so this is the part of the
/// tuple rules the kernel enforces. Address restrictions are widened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpPorts {
    pub bind: Option<BTreeSet<u16>>,
    pub connect: Option<BTreeSet<u16>>,
}

impl TcpPorts {
    pub fn from_rules(rules: &[NetworkRule]) -> Self {
        let mut bind = Some(BTreeSet::new());
        let mut connect = Some(BTreeSet::new());
        for rule in rules {
            let NetworkRule::Inet {
                family,
                sock_type,
                protocol,
                port,
                perms,
                ..
            } = rule
            else {
                continue;
            };
            let tcp = matches!(*family, AF_INET | AF_INET6)
                && *sock_type == SOCK_STREAM
                && matches!(*protocol, 0 | IPPROTO_TCP);
            if !tcp {
                continue;
            }
            for (perm, ports) in [(NET_PERM_BIND, &mut bind), (NET_PERM_CONNECT, &mut connect)] {
                if perms & perm == 0 {
                    continue;
                }
                match ports {
                    Some(set) if *port != 0 => {
                        set.insert(*port);
                    }
                    _ => *ports = None,
                }
            }
        }
        Self { bind, connect }
    }
}

/// A socket operation to be checked
#[derive(Debug, Clone)]
pub enum SocketAccess<'a> {
    Inet {
        family: u16,
        sock_type: u16,
        protocol: u16,
        /// `None` for sendmsg without an explicit destination
        dest: Option<(IpAddr, u16)>,
    },
    Unix {
        sock_type: u16,
        protocol: u16,
        path: &'a str,
        is_abstract: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct NetworkMaps {
    pub tuples: HashMap<NetKey, u32>,
    pub unix: HashMap<UnixKey, u32>,
}

impl NetworkMaps {
    pub fn install(&mut self, cgroup_id: u64, rules: &[NetworkRule]) {
        for rule in rules {
            match rule {
                NetworkRule::Inet {
                    family,
                    sock_type,
                    protocol,
                    addr,
                    port,
                    perms,
                } => {
                    let key = NetKey::new(cgroup_id, *family, *sock_type, *protocol, *addr, *port);
                    *self.tuples.entry(key).or_insert(0) |= perms;
                }
                NetworkRule::Unix {
                    sock_type,
                    protocol,
                    path,
                    is_abstract,
                    perms,
                } => {
                    let key = UnixKey::new(cgroup_id, *sock_type, *protocol, path, *is_abstract);
                    *self.unix.entry(key).or_insert(0) |= perms;
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty() && self.unix.is_empty()
    }

    /// Allowed permissions for an access, falling back from the exact tuple
    /// to any port and then to the wildcard tuple
    fn allowed(&self, cgroup_id: u64, access: &SocketAccess<'_>) -> u32 {
        match access {
            SocketAccess::Inet {
                family,
                sock_type,
                protocol,
                dest,
            } => {
                let (addr, port) = match dest {
                    Some((addr, port)) => (Some(*addr), *port),
                    None => (None, 0),
                };
                let exact = NetKey::new(cgroup_id, *family, *sock_type, *protocol, addr, port);
                let mut candidates = vec![exact, exact.any_port(), exact.wildcard()];
                // protocol 0 rules cover every protocol of the type
                if *protocol != 0 {
                    let generic = NetKey {
                        protocol: 0,
                        ..exact
                    };
                    candidates.extend([generic, generic.any_port(), generic.wildcard()]);
                }
                candidates
                    .iter()
                    .find_map(|key| self.tuples.get(key).copied())
                    .unwrap_or(0)
            }
            SocketAccess::Unix {
                sock_type,
                protocol,
                path,
                is_abstract,
            } => {
                let key = UnixKey::new(cgroup_id, *sock_type, *protocol, path, *is_abstract);
                self.unix.get(&key).copied().unwrap_or(0)
            }
        }
    }

    /// Decide a socket hook for a task in `cgroup_id`
    pub fn check(
        &self,
        cgroup_id: u64,
        hook: Hook,
        access: &SocketAccess<'_>,
        comm: &str,
        events: &DenyEventRing,
    ) -> Decision {
        if cgroup_id == 0 {
            return Decision::Allow;
        }
        let Some(required) = hook_permission(hook) else {
            return Decision::Allow;
        };
        if self.allowed(cgroup_id, access) & required == required {
            return Decision::Allow;
        }

        let name = match access {
            SocketAccess::Inet { dest: Some((addr, port)), .. } => format!("{addr}:{port}"),
            SocketAccess::Inet { dest: None, .. } => String::new(),
            SocketAccess::Unix { path, .. } => path.to_string(),
        };
        events.emit(DenyEvent::new(cgroup_id, (0, 0), required, hook, comm, &name));
        Decision::Deny
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const CG: u64 = 7;

    fn inet(dest: Option<(IpAddr, u16)>) -> SocketAccess<'static> {
        SocketAccess::Inet {
            family: AF_INET,
            sock_type: SOCK_DGRAM,
            protocol: 17,
            dest,
        }
    }

    #[test]
    fn test_tcp_ports_from_rules() {
        let rule = |port, perms| NetworkRule::Inet {
            family: AF_INET,
            sock_type: SOCK_STREAM,
            protocol: 0,
            addr: None,
            port,
            perms,
        };
        let ports = TcpPorts::from_rules(&[
            rule(443, NET_PERM_CONNECT | NET_PERM_CREATE),
            rule(80, NET_PERM_CONNECT),
            rule(53, NET_PERM_SEND),
        ]);
        assert_eq!(ports.bind, Some(BTreeSet::new()));
        assert_eq!(ports.connect, Some(BTreeSet::from([80, 443])));

        let open = TcpPorts::from_rules(&[
            NetworkRule::allow_any(AF_INET6, SOCK_STREAM),
            NetworkRule::allow_any(AF_INET, SOCK_DGRAM),
        ]);
        assert_eq!(open.bind, None);
        assert_eq!(open.connect, None);
    }

    #[test]
    fn test_exact_and_wildcard() {
        let dns: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();
        let mut maps = NetworkMaps::default();
        maps.install(
            CG,
            &[NetworkRule::Inet {
                family: AF_INET,
                sock_type: SOCK_DGRAM,
                protocol: 17,
                addr: Some(dns),
                port: 53,
                perms: NET_PERM_CONNECT | NET_PERM_SEND,
            }],
        );
        let events = DenyEventRing::new(8);

        let to_dns = inet(Some((dns, 53)));
        assert_eq!(
            maps.check(CG, Hook::SocketConnect, &to_dns, "dig", &events),
            Decision::Allow
        );
        let elsewhere = inet(Some((Ipv4Addr::new(1, 1, 1, 1).into(), 53)));
        assert_eq!(
            maps.check(CG, Hook::SocketConnect, &elsewhere, "dig", &events),
            Decision::Deny
        );
        // sendmsg with no destination only consults the wildcard tuple
        assert_eq!(
            maps.check(CG, Hook::SocketSendmsg, &inet(None), "dig", &events),
            Decision::Deny
        );
        assert_eq!(events.drain().len(), 2);

        maps.install(
            CG,
            &[NetworkRule::Inet {
                family: AF_INET,
                sock_type: SOCK_DGRAM,
                protocol: 17,
                addr: None,
                port: 0,
                perms: NET_PERM_SEND,
            }],
        );
        assert_eq!(
            maps.check(CG, Hook::SocketSendmsg, &inet(None), "dig", &events),
            Decision::Allow
        );
    }

    #[test]
    fn test_cgroup_zero_and_unix() {
        let maps = NetworkMaps::default();
        let events = DenyEventRing::new(8);
        assert_eq!(
            maps.check(0, Hook::SocketCreate, &inet(None), "x", &events),
            Decision::Allow
        );

        let mut maps = NetworkMaps::default();
        maps.install(
            CG,
            &[NetworkRule::Unix {
                sock_type: SOCK_STREAM,
                protocol: 0,
                path: "/run/dbus.sock".to_string(),
                is_abstract: false,
                perms: NET_PERM_CONNECT,
            }],
        );
        let access = SocketAccess::Unix {
            sock_type: SOCK_STREAM,
            protocol: 0,
            path: "/run/dbus.sock",
            is_abstract: false,
        };
        assert_eq!(
            maps.check(CG, Hook::SocketConnect, &access, "x", &events),
            Decision::Allow
        );
        let abstract_access = SocketAccess::Unix {
            sock_type: SOCK_STREAM,
            protocol: 0,
            path: "/run/dbus.sock",
            is_abstract: true,
        };
        assert_eq!(
            maps.check(CG, Hook::SocketConnect, &abstract_access, "x", &events),
            Decision::Deny
        );
    }

    #[test]
    fn test_allow_any() {
        let mut maps = NetworkMaps::default();
        maps.install(CG, &[NetworkRule::allow_any(AF_INET, SOCK_STREAM)]);
        let events = DenyEventRing::new(8);
        let access = SocketAccess::Inet {
            family: AF_INET,
            sock_type: SOCK_STREAM,
            protocol: 6,
            dest: Some((Ipv4Addr::new(93, 184, 216, 34).into(), 443)),
        };
        assert_eq!(
            maps.check(CG, Hook::SocketConnect, &access, "curl", &events),
            Decision::Allow
        );
    }
}
