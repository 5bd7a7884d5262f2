// src/container/cgroup.rs

//! cgroup v2 resource control
//!
//! Each container gets `<root>/bake/<id>` with `memory.max`, `cpu.max` and
//! `pids.max` written from its limits. When the hierarchy is not writable
//! the runtime falls back to rlimits.

use crate::container::ResourceStats;
use crate::container::limits::ResourceLimits;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CPU_PERIOD_US: u64 = 100_000;

/// `cpu.max` value for a percentage of one CPU
pub fn cpu_max_value(percent: Option<u8>) -> String {
    match percent {
        Some(p) => format!("{} {}", u64::from(p) * 1000, CPU_PERIOD_US),
        None => format!("max {CPU_PERIOD_US}"),
    }
}

fn limit_value(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "max".to_string())
}

#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Whether a v2 hierarchy is mounted and we may create groups in it
    pub fn available(root: &Path) -> bool {
        root.join("cgroup.controllers").exists()
            && fs::metadata(root).is_ok_and(|m| !m.permissions().readonly())
    }

    /// Create the group for `id` under `root` and apply `limits`
    pub fn create(root: &Path, id: &str, limits: &ResourceLimits) -> Result<Self> {
        let parent = root.join("bake");
        if !parent.exists() {
            fs::create_dir_all(&parent)?;
            // enable controllers for children; some may be missing
            if let Err(e) = fs::write(parent.join("cgroup.subtree_control"), "+memory +cpu +pids") {
                debug!("Could not enable cgroup controllers: {}", e);
            }
        }
        let path = parent.join(id);
        fs::create_dir_all(&path)
            .map_err(|e| Error::ContainerError(format!("create cgroup {}: {}", path.display(), e)))?;

        let cgroup = Self { path };
        cgroup.apply(limits)?;
        Ok(cgroup)
    }

    /// Handle on an existing group
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// The v2 group the calling process lives in, under `root`
    pub fn current(root: &Path) -> Option<Self> {
        let content = fs::read_to_string("/proc/self/cgroup").ok()?;
        let path = unified_path(&content)?;
        let dir = root.join(path.trim_start_matches('/'));
        dir.is_dir().then(|| Self::open(&dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The id the kernel reports for tasks in this group (its inode)
    pub fn id(&self) -> u64 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = fs::metadata(&self.path) {
                return meta.ino();
            }
        }
        0
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(file), value).map_err(|e| {
            Error::ContainerError(format!("write {} to {}: {}", value, file, e))
        })
    }

    pub fn apply(&self, limits: &ResourceLimits) -> Result<()> {
        self.write("memory.max", &limit_value(limits.memory_max))?;
        self.write("cpu.max", &cpu_max_value(limits.cpu_percent))?;
        self.write("pids.max", &limit_value(limits.process_count))?;
        Ok(())
    }

    pub fn add_process(&self, pid: u32) -> Result<()> {
        self.write("cgroup.procs", &pid.to_string())
    }

    pub fn pids(&self) -> Vec<u32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    fn read_u64(&self, file: &str) -> Option<u64> {
        fs::read_to_string(self.path.join(file)).ok()?.trim().parse().ok()
    }

    pub fn stats(&self) -> ResourceStats {
        let cpu_time_us = fs::read_to_string(self.path.join("cpu.stat"))
            .ok()
            .and_then(|s| {
                s.lines()
                    .find_map(|l| l.strip_prefix("usage_usec ").and_then(|v| v.trim().parse().ok()))
            })
            .unwrap_or(0);
        ResourceStats {
            memory_bytes: self.read_u64("memory.current").unwrap_or(0),
            cpu_time_us,
            process_count: self.read_u64("pids.current").unwrap_or(0) as usize,
        }
    }

    /// Kill every task in the group
    pub fn kill_all(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() && fs::write(&kill_file, "1").is_ok() {
            return;
        }
        #[cfg(unix)]
        for pid in self.pids() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    pub fn destroy(self) -> Result<()> {
        self.kill_all();
        if let Err(e) = fs::remove_dir(&self.path) {
            warn!("Failed to remove cgroup {}: {}", self.path.display(), e);
        }
        Ok(())
    }
}

/// Path of the unified hierarchy entry (`0::<path>`) in `/proc/<pid>/cgroup`
fn unified_path(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
}
