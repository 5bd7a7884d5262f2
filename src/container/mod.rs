// src/container/mod.rs

//! Container runtime abstraction
//!
//! Build commands run inside a container created by a [`ContainerRuntime`].
//! Three backends implement the same [`Container`] trait:
//!
//! - [`linux::NamespaceRuntime`]: user/PID/mount/net namespaces, a pivoted
//!   root, cgroup v2 limits and Landlock policy (Linux only)
//! - [`hcs::HcsRuntime`]: a Host Compute Service VM booted from a VHDX
//!   chain, limited by a job object (Windows only)
//! - [`HostRuntime`]: unconfined execution directly on the host, used when
//!   a recipe turns confinement off
//!
//! The backend is picked at runtime so callers stay portable.

pub mod cgroup;
pub mod hcs;
pub mod job;
pub mod limits;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod lock;
pub mod monitor;
pub mod options;
pub mod procfs;
pub mod transfer;

pub use limits::ResourceLimits;
pub use options::{Capabilities, ContainerOptions, IsolationMode, NetworkConfig, VmResources};
pub use transfer::FileTransfer;

use crate::error::{Error, Result};
use crate::layers::{BindMount, Layer};
use crate::policy::PolicyEvaluator;
use lock::RootfsLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Flags for [`SpawnSpec`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnFlags(u32);

impl SpawnFlags {
    /// Block in `spawn` until the process exits
    pub const WAIT: SpawnFlags = SpawnFlags(1);

    pub const fn empty() -> Self {
        SpawnFlags(0)
    }

    pub const fn contains(&self, other: SpawnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A command to run inside a container
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Program path as the payload sees it
    pub path: String,
    pub args: Vec<String>,
    /// Complete environment; nothing is inherited
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub flags: SpawnFlags,
    /// Host file receiving stdout and stderr, appended to
    pub log: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn log(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn wait(mut self) -> Self {
        self.flags = SpawnFlags::WAIT;
        self
    }

    /// Render for log headers
    pub fn command_line(&self) -> String {
        std::iter::once(self.path.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A process started by `spawn`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Set once the exit status has been collected
    pub exit_code: Option<i32>,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    pub memory_bytes: u64,
    /// Cumulative CPU time in microseconds
    pub cpu_time_us: u64,
    pub process_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub rss_bytes: u64,
    pub cpu_percent: f32,
}

/// Where resource usage of a container can be sampled from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsSource {
    Cgroup(PathBuf),
    /// Process trees rooted at these pids
    Pids(Vec<u32>),
    None,
}

impl StatsSource {
    fn proc_root() -> &'static Path {
        Path::new("/proc")
    }

    fn tree(&self) -> Vec<u32> {
        match self {
            StatsSource::Cgroup(path) => cgroup::Cgroup::open(path).pids(),
            StatsSource::Pids(roots) => roots
                .iter()
                .flat_map(|pid| procfs::descendants(Self::proc_root(), *pid))
                .collect(),
            StatsSource::None => Vec::new(),
        }
    }

    pub fn sample(&self) -> ResourceStats {
        match self {
            StatsSource::Cgroup(path) => cgroup::Cgroup::open(path).stats(),
            StatsSource::Pids(_) => procfs::stats(Self::proc_root(), &self.tree()),
            StatsSource::None => ResourceStats::default(),
        }
    }

    pub fn processes(&self) -> Vec<ProcessInfo> {
        procfs::processes(Self::proc_root(), &self.tree())
    }
}

/// A running sandbox
pub trait Container: Send {
    fn id(&self) -> &str;

    /// Host path of the composed rootfs
    fn rootfs(&self) -> &Path;

    /// Path under which payloads address the chef tree
    fn chef_root(&self) -> PathBuf;

    fn spawn(&mut self, spec: &SpawnSpec) -> Result<ProcessHandle>;

    /// Collect the exit code if the process has finished
    fn try_wait(&mut self, handle: &mut ProcessHandle) -> Result<Option<i32>>;

    fn wait(&mut self, handle: &mut ProcessHandle) -> Result<i32> {
        loop {
            if let Some(code) = self.try_wait(handle)? {
                return Ok(code);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn kill(&mut self, handle: &ProcessHandle) -> Result<()>;

    fn upload(&mut self, files: &[FileTransfer]) -> Result<()> {
        transfer::upload(self.rootfs(), files).map(|_| ())
    }

    fn download(&mut self, files: &[FileTransfer]) -> Result<()> {
        transfer::download(self.rootfs(), files).map(|_| ())
    }

    fn stats_source(&self) -> StatsSource;

    /// Policy installed for this container, if any
    fn policy(&self) -> Option<&PolicyEvaluator> {
        None
    }

    fn stats(&self) -> Result<ResourceStats> {
        Ok(self.stats_source().sample())
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.stats_source().processes())
    }

    /// Kill what is left and release every resource
    fn destroy(self: Box<Self>) -> Result<()>;
}

/// Creates containers for one backend
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, id: &str, options: ContainerOptions) -> Result<Box<dyn Container>>;
}

/// Runtime for the current host; unconfined builds always run on the host
pub fn default_runtime(confined: bool) -> Box<dyn ContainerRuntime> {
    if confined {
        #[cfg(target_os = "linux")]
        return Box::new(linux::NamespaceRuntime::new());
        #[cfg(windows)]
        return Box::new(hcs::HcsRuntime::new(hcs::ComputeCore::new()));
    }
    Box::new(HostRuntime)
}

/// Exit code of a finished process; signals are reported negated
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Poll `try_wait` until the process exits, killing it once `timeout` passes
pub(crate) fn wait_with_timeout<C: Container + ?Sized>(
    container: &mut C,
    handle: &mut ProcessHandle,
    timeout: Option<Duration>,
    poll: Duration,
) -> Result<i32> {
    let start = Instant::now();
    loop {
        if let Some(code) = container.try_wait(handle)? {
            return Ok(code);
        }
        if let Some(limit) = timeout {
            if start.elapsed() > limit {
                container.kill(handle)?;
                return Err(Error::ContainerError(format!(
                    "process {} timed out after {:?}",
                    handle.pid, limit
                )));
            }
        }
        std::thread::sleep(poll);
    }
}

/// Open a spawn log for appending, or discard output
pub(crate) fn log_stdio(log: Option<&Path>) -> Result<(Stdio, Stdio)> {
    match log {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            let err = file.try_clone()?;
            Ok((Stdio::from(file), Stdio::from(err)))
        }
        None => Ok((Stdio::null(), Stdio::null())),
    }
}

/// Host-directory layers of a layer list, as bind mounts
pub(crate) fn host_mounts(layers: &[Layer]) -> Vec<BindMount> {
    layers.iter().filter_map(Layer::bind_mount).collect()
}

/// Runs payloads as ordinary host processes
///
/// Host-directory layers are not mounted; their host paths are reachable
/// directly. Limits are applied through a cgroup when one can be created.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRuntime;

impl ContainerRuntime for HostRuntime {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create(&self, id: &str, options: ContainerOptions) -> Result<Box<dyn Container>> {
        let root = options.staging_dir.clone();
        let lock = RootfsLock::acquire(&root)?;

        let cgroup = if options.has(Capabilities::CGROUPS) {
            host_cgroup(id, &options.limits)
        } else {
            None
        };
        let job = if options.has(Capabilities::CGROUPS) {
            job::JobObject::create(id, &job::JobLimits::from_limits(&options.limits)).ok()
        } else {
            None
        };

        info!("Created unconfined container {} at {:?}", id, root);
        Ok(Box::new(HostContainer {
            id: id.to_string(),
            root,
            children: HashMap::new(),
            cgroup,
            job,
            wait_timeout: options.wait_timeout,
            _lock: lock,
        }))
    }
}

#[cfg(target_os = "linux")]
pub(crate) fn host_cgroup(id: &str, limits: &ResourceLimits) -> Option<cgroup::Cgroup> {
    let root = Path::new(cgroup::CGROUP_ROOT);
    if !cgroup::Cgroup::available(root) {
        warn!("cgroup v2 is not writable, limits are not enforced");
        return None;
    }
    cgroup::Cgroup::create(root, id, limits)
        .map_err(|e| warn!("Failed to create cgroup: {}", e))
        .ok()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn host_cgroup(_id: &str, _limits: &ResourceLimits) -> Option<cgroup::Cgroup> {
    None
}

struct HostContainer {
    id: String,
    root: PathBuf,
    children: HashMap<u32, Child>,
    cgroup: Option<cgroup::Cgroup>,
    job: Option<job::JobObject>,
    wait_timeout: Option<Duration>,
    _lock: RootfsLock,
}

impl Container for HostContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn rootfs(&self) -> &Path {
        &self.root
    }

    fn chef_root(&self) -> PathBuf {
        self.root.join("chef")
    }

    fn spawn(&mut self, spec: &SpawnSpec) -> Result<ProcessHandle> {
        let (stdout, stderr) = log_stdio(spec.log.as_deref())?;
        let mut cmd = Command::new(&spec.path);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        debug!("[{}] spawn {}", self.id, spec.command_line());
        let child = cmd
            .spawn()
            .map_err(|e| Error::ContainerError(format!("spawn {}: {}", spec.path, e)))?;
        let pid = child.id();
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.add_process(pid) {
                warn!("Failed to move {} into cgroup: {}", pid, e);
            }
        }
        if let Some(job) = &self.job {
            job.assign(&child)?;
        }
        self.children.insert(pid, child);

        let mut handle = ProcessHandle::new(pid);
        if spec.flags.contains(SpawnFlags::WAIT) {
            self.wait(&mut handle)?;
        }
        Ok(handle)
    }

    fn try_wait(&mut self, handle: &mut ProcessHandle) -> Result<Option<i32>> {
        if let Some(code) = handle.exit_code {
            return Ok(Some(code));
        }
        let Some(child) = self.children.get_mut(&handle.pid) else {
            return Err(Error::NotFound(format!("process {}", handle.pid)));
        };
        match child.try_wait()? {
            Some(status) => {
                let code = exit_code(status);
                self.children.remove(&handle.pid);
                handle.exit_code = Some(code);
                Ok(Some(code))
            }
            None => Ok(None),
        }
    }

    fn wait(&mut self, handle: &mut ProcessHandle) -> Result<i32> {
        let timeout = self.wait_timeout;
        wait_with_timeout(self, handle, timeout, Duration::from_millis(20))
    }

    fn kill(&mut self, handle: &ProcessHandle) -> Result<()> {
        if let Some(child) = self.children.get_mut(&handle.pid) {
            child.kill()?;
            let _ = child.wait();
            self.children.remove(&handle.pid);
        }
        Ok(())
    }

    fn stats_source(&self) -> StatsSource {
        match &self.cgroup {
            Some(cgroup) => StatsSource::Cgroup(cgroup.path().to_path_buf()),
            None => StatsSource::Pids(self.children.keys().copied().collect()),
        }
    }

    fn destroy(mut self: Box<Self>) -> Result<()> {
        for (pid, mut child) in self.children.drain() {
            debug!("Killing leftover process {}", pid);
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.destroy()?;
        }
        info!("Destroyed container {}", self.id);
        Ok(())
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn shell(script: &str) -> SpawnSpec {
        SpawnSpec::new("/bin/sh")
            .args(["-c", script])
            .env(vec![("PATH".to_string(), "/usr/bin:/bin".to_string())])
    }

    #[test]
    fn test_host_spawn_wait_and_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("build.log");
        let runtime = HostRuntime;
        let mut container = runtime
            .create("t1", ContainerOptions::new(dir.path().join("root")))
            .unwrap();
        assert_eq!(container.chef_root(), dir.path().join("root/chef"));

        let handle = container
            .spawn(&shell("echo out; echo err >&2; exit 3").log(&log).wait())
            .unwrap();
        assert_eq!(handle.exit_code, Some(3));
        let text = fs::read_to_string(&log).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));

        let mut handle = container.spawn(&shell("exit 0")).unwrap();
        assert_eq!(container.wait(&mut handle).unwrap(), 0);
        container.destroy().unwrap();
    }

    #[test]
    fn test_host_kill_reports_signal() {
        let dir = TempDir::new().unwrap();
        let mut container = HostRuntime
            .create("t2", ContainerOptions::new(dir.path()))
            .unwrap();
        let mut handle = container.spawn(&shell("sleep 30")).unwrap();
        assert_eq!(container.try_wait(&mut handle).unwrap(), None);
        assert!(container.stats().unwrap().process_count >= 1);
        container.kill(&handle).unwrap();
        assert!(container.try_wait(&mut handle).is_err());
        container.destroy().unwrap();
    }

    #[test]
    fn test_rootfs_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = HostRuntime.create("a", ContainerOptions::new(dir.path())).unwrap();
        assert!(HostRuntime.create("b", ContainerOptions::new(dir.path())).is_err());
        first.destroy().unwrap();
        HostRuntime
            .create("c", ContainerOptions::new(dir.path()))
            .unwrap()
            .destroy()
            .unwrap();
    }

    #[test]
    fn test_exit_code_signal() {
        let status = Command::new("/bin/sh")
            .args(["-c", "kill -TERM $$"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), -15);
    }
}
