// src/container/linux.rs

//! Namespace containers
//!
//! Each `spawn` forks a setup process that unshares fresh mount, UTS, IPC
//! and PID namespaces (plus an empty network namespace unless the container
//! was given network access) and pivots into the composed rootfs. It then
//! forks once more: the second child is pid 1 of the new PID namespace, so
//! it mounts `/proc`, enforces the policy through Landlock and execs the
//! payload. The parent only learns the setup pid; the payload's exit code
//! is passed through it.
//!
//! Before forking, the policy evaluator decides the program and working
//! directory, so refused spawns are reported as deny events.

use crate::container::cgroup::{CGROUP_ROOT, Cgroup};
use crate::container::lock::RootfsLock;
use crate::container::{
    Capabilities, Container, ContainerOptions, ContainerRuntime, ProcessHandle, ResourceLimits,
    SpawnFlags, SpawnSpec, StatsSource, host_cgroup, host_mounts, log_stdio, procfs,
    wait_with_timeout,
};
use crate::error::{Error, Result};
use crate::layers::BindMount;
use crate::policy::key::FsResolver;
use crate::policy::{Policy, PolicyEvaluator};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::resource::{Resource, setrlimit};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, fork, pipe};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Directories every rootfs needs before the pivot
const ROOTFS_DIRS: &[&str] = &["dev", "etc", "proc", "sys", "tmp", "chef", "var/tmp"];

/// Device nodes bound in from the host
const DEVICE_NODES: &[&str] = &["null", "zero", "urandom", "random", "tty"];

#[derive(Debug, Default, Clone, Copy)]
pub struct NamespaceRuntime;

impl NamespaceRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl ContainerRuntime for NamespaceRuntime {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn create(&self, id: &str, options: ContainerOptions) -> Result<Box<dyn Container>> {
        let root = options.staging_dir.clone();
        let lock = RootfsLock::acquire(&root)?;
        prepare_rootfs(&root)?;

        // the policy is keyed by cgroup, so a policy alone asks for one too
        let cgroup = if options.has(Capabilities::CGROUPS) || options.has(Capabilities::POLICY) {
            host_cgroup(id, &options.limits)
        } else {
            None
        };
        let cgroup_id = match &cgroup {
            Some(cgroup) => cgroup.id(),
            None => Cgroup::current(Path::new(CGROUP_ROOT))
                .map(|c| c.id())
                .unwrap_or(0),
        };
        if cgroup_id == 0 && options.has(Capabilities::POLICY) {
            warn!("No cgroup for container {}, policy decisions fall back to allow", id);
        }

        let policy = match (&options.policy, options.has(Capabilities::POLICY)) {
            (Some(policy), true) => Some(policy.clone()),
            _ => None,
        };
        let evaluator = match &policy {
            Some(policy) => Some(PolicyEvaluator::install(
                policy,
                cgroup_id,
                &root,
                Box::new(FsResolver),
            )?),
            None => None,
        };

        let mounts = host_mounts(&options.layers);
        info!(
            "Created container {} at {:?} [{}]",
            id,
            root,
            options.capabilities.names().join(",")
        );

        Ok(Box::new(NamespaceContainer {
            id: id.to_string(),
            root,
            setup: ChildSetup {
                capabilities: options.capabilities,
                mounts,
                policy,
                hostname: options.hostname,
                uid: options.uid,
                gid: options.gid,
                // rlimits only stand in when no cgroup carries the limits
                rlimits: if cgroup.is_none() {
                    options.limits
                } else {
                    ResourceLimits::default()
                },
            },
            cgroup,
            evaluator,
            children: HashSet::new(),
            wait_timeout: options.wait_timeout,
            _lock: lock,
        }))
    }
}

fn prepare_rootfs(root: &Path) -> Result<()> {
    for dir in ROOTFS_DIRS {
        fs::create_dir_all(root.join(dir))?;
    }
    let dev = root.join("dev");
    for node in DEVICE_NODES {
        let path = dev.join(node);
        if !path.exists() {
            File::create(&path)?;
        }
    }
    Ok(())
}

/// Everything the forked init needs, captured at create time
#[derive(Debug, Clone)]
struct ChildSetup {
    capabilities: Capabilities,
    mounts: Vec<BindMount>,
    policy: Option<Policy>,
    hostname: String,
    uid: u32,
    gid: u32,
    rlimits: ResourceLimits,
}

impl ChildSetup {
    fn namespace_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWPID;
        if !self.capabilities.contains(Capabilities::NETWORK) {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.capabilities.contains(Capabilities::USERNS) {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }
}

struct NamespaceContainer {
    id: String,
    root: PathBuf,
    setup: ChildSetup,
    cgroup: Option<Cgroup>,
    evaluator: Option<PolicyEvaluator>,
    children: HashSet<u32>,
    wait_timeout: Option<Duration>,
    _lock: RootfsLock,
}

impl Container for NamespaceContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn rootfs(&self) -> &Path {
        &self.root
    }

    fn chef_root(&self) -> PathBuf {
        PathBuf::from("/chef")
    }

    fn spawn(&mut self, spec: &SpawnSpec) -> Result<ProcessHandle> {
        // The log lives on the host, so it is opened before the pivot
        let (stdout, stderr) = log_stdio(spec.log.as_deref())?;
        let (ready_rx, ready_tx) =
            pipe().map_err(|e| Error::ContainerError(format!("pipe failed: {}", e)))?;
        let mut ready_rx = File::from(ready_rx);
        let mut ready_tx = File::from(ready_tx);

        debug!("[{}] spawn {}", self.id, spec.command_line());
        if let Some(evaluator) = &self.evaluator {
            let path_var = spec.env.iter().find(|(k, _)| k == "PATH").map(|(_, v)| v.as_str());
            let cwd = spec.cwd.as_deref().unwrap_or(Path::new("/"));
            evaluator.check_spawn(&spec.path, path_var, cwd)?;
        }

        // SAFETY: the child only sets up its namespaces and execs
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(ready_rx);
                let pid = child.as_raw() as u32;
                if let Some(cgroup) = &self.cgroup {
                    if let Err(e) = cgroup.add_process(pid) {
                        warn!("Failed to move {} into cgroup: {}", pid, e);
                    }
                }
                // release the child once it is accounted for
                let _ = ready_tx.write_all(&[1]);
                drop(ready_tx);
                self.children.insert(pid);

                let mut handle = ProcessHandle::new(pid);
                if spec.flags.contains(SpawnFlags::WAIT) {
                    self.wait(&mut handle)?;
                }
                Ok(handle)
            }
            Ok(ForkResult::Child) => {
                drop(ready_tx);
                let mut byte = [0u8; 1];
                let _ = ready_rx.read_exact(&mut byte);
                let code = match child_main(&self.root, &self.setup, spec, stdout, stderr) {
                    Ok(code) => code,
                    Err(e) => {
                        eprintln!("bake: container setup failed: {}", e);
                        127
                    }
                };
                std::process::exit(code);
            }
            Err(e) => Err(Error::ContainerError(format!("Fork failed: {}", e))),
        }
    }

    fn try_wait(&mut self, handle: &mut ProcessHandle) -> Result<Option<i32>> {
        if let Some(code) = handle.exit_code {
            return Ok(Some(code));
        }
        if !self.children.contains(&handle.pid) {
            return Err(Error::NotFound(format!("process {}", handle.pid)));
        }
        let pid = Pid::from_raw(handle.pid as i32);
        let code = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, sig, _)) => -(sig as i32),
            Ok(_) => return Ok(None),
            Err(e) => return Err(Error::ContainerError(format!("Wait failed: {}", e))),
        };
        self.children.remove(&handle.pid);
        handle.exit_code = Some(code);
        Ok(Some(code))
    }

    fn wait(&mut self, handle: &mut ProcessHandle) -> Result<i32> {
        let timeout = self.wait_timeout;
        wait_with_timeout(self, handle, timeout, Duration::from_millis(10))
    }

    fn kill(&mut self, handle: &ProcessHandle) -> Result<()> {
        if !self.children.contains(&handle.pid) {
            return Ok(());
        }
        // init's descendants live in its PID namespace; kill the whole tree
        let tree = procfs::descendants(Path::new("/proc"), handle.pid);
        for pid in tree.iter().rev() {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGKILL);
        }
        let _ = waitpid(Pid::from_raw(handle.pid as i32), None);
        self.children.remove(&handle.pid);
        Ok(())
    }

    fn stats_source(&self) -> StatsSource {
        match &self.cgroup {
            Some(cgroup) => StatsSource::Cgroup(cgroup.path().to_path_buf()),
            None => StatsSource::Pids(self.children.iter().copied().collect()),
        }
    }

    fn policy(&self) -> Option<&PolicyEvaluator> {
        self.evaluator.as_ref()
    }

    fn destroy(mut self: Box<Self>) -> Result<()> {
        let pids: Vec<u32> = self.children.iter().copied().collect();
        for pid in pids {
            debug!("Killing leftover init {}", pid);
            self.kill(&ProcessHandle::new(pid))?;
        }
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.destroy()?;
        }
        info!("Destroyed container {}", self.id);
        Ok(())
    }
}

/// Body of the forked init; returns the payload's exit code
fn child_main(
    root: &Path,
    setup: &ChildSetup,
    spec: &SpawnSpec,
    stdout: Stdio,
    stderr: Stdio,
) -> Result<i32> {
    let outer_uid = nix::unistd::getuid().as_raw();
    let outer_gid = nix::unistd::getgid().as_raw();

    unshare(setup.namespace_flags())
        .map_err(|e| Error::ContainerError(format!("Unshare failed: {}", e)))?;

    if setup.capabilities.contains(Capabilities::USERNS) {
        map_identity(outer_uid, outer_gid)?;
    }

    if !setup.capabilities.contains(Capabilities::NETWORK) {
        // loopback only; failure leaves the namespace without lo
        if let Ok(status) = Command::new("ip").args(["link", "set", "lo", "up"]).status() {
            if !status.success() {
                debug!("Failed to bring up loopback interface");
            }
        }
    }

    if let Err(e) = nix::unistd::sethostname(&setup.hostname) {
        warn!("sethostname failed: {}", e);
    }

    setup_mount_namespace(root, &setup.mounts)?;

    // unshare(CLONE_NEWPID) only moves our children into the namespace
    // SAFETY: the child mounts /proc, restricts itself and execs
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(stdout);
            drop(stderr);
            let code = match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => code,
                Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                Ok(status) => {
                    return Err(Error::ContainerError(format!(
                        "unexpected payload status {:?}",
                        status
                    )));
                }
                Err(e) => return Err(Error::ContainerError(format!("Wait failed: {}", e))),
            };
            Ok(code)
        }
        Ok(ForkResult::Child) => {
            let e = exec_payload(setup, spec, stdout, stderr);
            eprintln!("bake: {}", e);
            std::process::exit(127);
        }
        Err(e) => Err(Error::ContainerError(format!("Fork failed: {}", e))),
    }
}

/// Body of pid 1 in the new PID namespace; only returns on failure
fn exec_payload(setup: &ChildSetup, spec: &SpawnSpec, stdout: Stdio, stderr: Stdio) -> Error {
    if let Err(e) = mount_proc() {
        debug!("Mounting /proc failed: {}", e);
    }
    apply_rlimits(&setup.rlimits);

    if let Some(policy) = &setup.policy {
        let restrict_network = setup.capabilities.contains(Capabilities::NETWORK);
        match crate::policy::landlock::enforce(policy, restrict_network) {
            Ok(status) => debug!("Landlock enforcement: {:?}", status),
            Err(e) => return e,
        }
    }

    if let Err(e) = drop_privileges(setup) {
        return e;
    }

    let e = Command::new(&spec.path)
        .args(&spec.args)
        .env_clear()
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .current_dir(spec.cwd.as_deref().unwrap_or(Path::new("/")))
        .exec();
    Error::ContainerError(format!("Exec {} failed: {}", spec.path, e))
}

/// Mount a procfs that shows the caller's PID namespace
fn mount_proc() -> Result<()> {
    mount::<str, str, str, str>(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )
    .map_err(|e| Error::ContainerError(format!("mount /proc failed: {}", e)))
}

/// Map root in the new user namespace onto the invoking user
fn map_identity(uid: u32, gid: u32) -> Result<()> {
    let write = |file: &str, value: String| {
        fs::write(format!("/proc/self/{file}"), value)
            .map_err(|e| Error::ContainerError(format!("write {}: {}", file, e)))
    };
    write("setgroups", "deny".to_string())?;
    write("uid_map", format!("0 {uid} 1"))?;
    write("gid_map", format!("0 {gid} 1"))?;
    Ok(())
}

/// Bind the layers and devices into `root` and make it `/`
fn setup_mount_namespace(root: &Path, mounts: &[BindMount]) -> Result<()> {
    mount::<str, str, str, str>(None, "/", None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)
        .map_err(|e| Error::ContainerError(format!("mount --make-rprivate failed: {}", e)))?;

    // pivot_root needs the new root to be a mount point
    mount::<Path, Path, str, str>(Some(root), root, None, MsFlags::MS_BIND | MsFlags::MS_REC, None)
        .map_err(|e| Error::ContainerError(format!("bind {} failed: {}", root.display(), e)))?;

    for node in DEVICE_NODES {
        let source = Path::new("/dev").join(node);
        let target = root.join("dev").join(node);
        if source.exists() {
            let _ = mount::<Path, Path, str, str>(
                Some(&source),
                &target,
                None,
                MsFlags::MS_BIND,
                None,
            );
        }
    }

    for bm in mounts {
        bind_into(root, bm)?;
    }

    std::env::set_current_dir(root)
        .map_err(|e| Error::ContainerError(format!("chdir failed: {}", e)))?;
    nix::unistd::pivot_root(".", ".")
        .map_err(|e| Error::ContainerError(format!("pivot_root failed: {}", e)))?;
    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| Error::ContainerError(format!("detach old root failed: {}", e)))?;
    std::env::set_current_dir("/")
        .map_err(|e| Error::ContainerError(format!("chdir failed: {}", e)))?;
    Ok(())
}

fn bind_into(root: &Path, bm: &BindMount) -> Result<()> {
    if !bm.source.exists() {
        debug!("Skipping bind mount, source doesn't exist: {:?}", bm.source);
        return Ok(());
    }
    let target = crate::policy::guest_to_host(root, &bm.target);
    if bm.source.is_dir() {
        fs::create_dir_all(&target)?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            File::create(&target)?;
        }
    }

    mount::<Path, Path, str, str>(
        Some(&bm.source),
        &target,
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None,
    )
    .map_err(|e| {
        Error::ContainerError(format!(
            "Bind mount {} -> {} failed: {}",
            bm.source.display(),
            bm.target.display(),
            e
        ))
    })?;

    if !bm.writable {
        mount::<Path, Path, str, str>(
            None,
            &target,
            None,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            None,
        )
        .ok();
    }
    Ok(())
}

fn apply_rlimits(limits: &ResourceLimits) {
    if let Some(bytes) = limits.memory_max {
        if let Err(e) = setrlimit(Resource::RLIMIT_AS, bytes, bytes) {
            warn!("setrlimit RLIMIT_AS failed: {}", e);
        }
    }
    if let Some(count) = limits.process_count {
        if let Err(e) = setrlimit(Resource::RLIMIT_NPROC, count, count) {
            warn!("setrlimit RLIMIT_NPROC failed: {}", e);
        }
    }
}

/// Run the payload as the configured identity when starting as real root
fn drop_privileges(setup: &ChildSetup) -> Result<()> {
    if setup.capabilities.contains(Capabilities::USERNS) || !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    if setup.uid == 0 {
        return Ok(());
    }
    nix::unistd::setgid(Gid::from_raw(setup.gid))
        .map_err(|e| Error::ContainerError(format!("setgid failed: {}", e)))?;
    nix::unistd::setuid(Uid::from_raw(setup.uid))
        .map_err(|e| Error::ContainerError(format!("setuid failed: {}", e)))?;
    Ok(())
}

/// Whether namespace containers can be created by this process
pub fn isolation_available() -> bool {
    if nix::unistd::geteuid().is_root() {
        return true;
    }
    let path = Path::new("/proc/sys/kernel/unprivileged_userns_clone");
    match fs::read_to_string(path) {
        Ok(content) => content.trim() == "1",
        Err(_) => true,
    }
}
