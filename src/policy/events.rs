// src/policy/events.rs

//! Deny-event ring buffer
//!
//! Emission never blocks: if the buffer is full or momentarily locked the
//! event is dropped and counted. Consumers treat the drained events as an
//! unordered multiset.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacity used by containers unless configured otherwise
pub const DEFAULT_CAPACITY: usize = 4096;

/// Task command names are truncated to this many bytes
pub const COMM_LEN: usize = 16;
/// File names are truncated to this many bytes
pub const NAME_LEN: usize = 256;

/// Enforcement point that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    FileOpen,
    BprmCheck,
    InodeCreate,
    InodeMkdir,
    InodeMknod,
    InodeUnlink,
    InodeRmdir,
    InodeLink,
    InodeSymlink,
    InodeRename,
    InodeSetattr,
    PathTruncate,
    SocketCreate,
    SocketBind,
    SocketConnect,
    SocketListen,
    SocketAccept,
    SocketSendmsg,
    Mount,
}

impl Hook {
    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::FileOpen => "file_open",
            Hook::BprmCheck => "bprm_check_security",
            Hook::InodeCreate => "inode_create",
            Hook::InodeMkdir => "inode_mkdir",
            Hook::InodeMknod => "inode_mknod",
            Hook::InodeUnlink => "inode_unlink",
            Hook::InodeRmdir => "inode_rmdir",
            Hook::InodeLink => "inode_link",
            Hook::InodeSymlink => "inode_symlink",
            Hook::InodeRename => "inode_rename",
            Hook::InodeSetattr => "inode_setattr",
            Hook::PathTruncate => "path_truncate",
            Hook::SocketCreate => "socket_create",
            Hook::SocketBind => "socket_bind",
            Hook::SocketConnect => "socket_connect",
            Hook::SocketListen => "socket_listen",
            Hook::SocketAccept => "socket_accept",
            Hook::SocketSendmsg => "socket_sendmsg",
            Hook::Mount => "sb_mount",
        }
    }

    /// Inode hooks that are checked for write access on the parent directory
    pub fn checks_parent(&self) -> bool {
        matches!(
            self,
            Hook::InodeCreate
                | Hook::InodeMkdir
                | Hook::InodeMknod
                | Hook::InodeUnlink
                | Hook::InodeRmdir
                | Hook::InodeLink
                | Hook::InodeSymlink
                | Hook::InodeRename
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenyEvent {
    pub cgroup_id: u64,
    pub dev: u64,
    pub ino: u64,
    pub required_mask: u32,
    pub hook_id: u32,
    pub comm: String,
    pub name: String,
}

impl DenyEvent {
    pub fn new(
        cgroup_id: u64,
        (dev, ino): (u64, u64),
        required_mask: u32,
        hook: Hook,
        comm: &str,
        name: &str,
    ) -> Self {
        Self {
            cgroup_id,
            dev,
            ino,
            required_mask,
            hook_id: hook.id(),
            comm: truncate(comm, COMM_LEN),
            name: truncate(name, NAME_LEN),
        }
    }
}

/// Truncate to at most `max` bytes on a char boundary
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Bounded, non-blocking event buffer
#[derive(Debug)]
pub struct DenyEventRing {
    events: Mutex<VecDeque<DenyEvent>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for DenyEventRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DenyEventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Record an event; returns `false` when it had to be dropped
    pub fn emit(&self, event: DenyEvent) -> bool {
        match self.events.try_lock() {
            Ok(mut events) if events.len() < self.capacity => {
                events.push_back(event);
                true
            }
            _ => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Take every buffered event
    pub fn drain(&self) -> Vec<DenyEvent> {
        match self.events.lock() {
            Ok(mut events) => events.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ino: u64) -> DenyEvent {
        DenyEvent::new(1, (2, ino), 1, Hook::FileOpen, "cat", "file")
    }

    #[test]
    fn test_ring_drops_when_full() {
        let ring = DenyEventRing::new(2);
        assert!(ring.emit(event(1)));
        assert!(ring.emit(event(2)));
        assert!(!ring.emit(event(3)));
        assert_eq!(ring.dropped(), 1);

        let drained = ring.drain();
        assert_eq!(drained.len(), 2);
        assert!(ring.drain().is_empty());
        assert!(ring.emit(event(4)));
    }

    #[test]
    fn test_event_truncation() {
        let long = "x".repeat(40);
        let e = DenyEvent::new(1, (0, 0), 1, Hook::BprmCheck, &long, "n");
        assert_eq!(e.comm.len(), COMM_LEN);
        assert_eq!(e.hook_id, Hook::BprmCheck.id());
        assert_eq!(truncate("héllo", 2), "h");
    }
}
