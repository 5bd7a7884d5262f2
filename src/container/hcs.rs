// src/container/hcs.rs

//! Host Compute Service containers
//!
//! A container is an HCS compute system booted from the VHDX chain the
//! layer composer prepares. All calls into `vmcompute` go through the
//! [`HcsApi`] trait; [`ComputeCore`] is the real implementation and only
//! exists on Windows, so the runtime logic stays testable everywhere.
//!
//! Process exit is observed by polling the process properties every
//! 250 ms until HCS reports the process as exited with a code.

use crate::container::job::JobLimits;
use crate::container::lock::RootfsLock;
use crate::container::options::WindowsRootfsType;
use crate::container::{
    Container, ContainerOptions, ContainerRuntime, ProcessHandle, ProcessInfo, ResourceStats,
    SpawnFlags, SpawnSpec, StatsSource, host_mounts, wait_with_timeout,
};
use crate::error::{Error, Result};
use crate::layers::BindMount;
use crate::layers::vhdx::{self, DiskTool, VhdxChain};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interval between process status queries
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Port the guest's Plan9 server listens on
const PLAN9_PORT: u16 = 564;

const STATISTICS_QUERY: &str = r#"{"PropertyTypes":["Statistics"]}"#;
const PROCESS_LIST_QUERY: &str = r#"{"PropertyTypes":["ProcessList"]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
}

/// A process created inside a compute system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcsProcess {
    pub handle: u64,
    pub pid: u32,
}

/// The subset of the HCS API the runtime needs
///
/// Handles are opaque; implementations map them to their own objects.
pub trait HcsApi: Send + Sync {
    fn create_system(&self, id: &str, config: &str) -> Result<u64>;
    fn start_system(&self, system: u64) -> Result<()>;
    /// Terminate the system if it runs and release the handle
    fn close_system(&self, system: u64) -> Result<()>;
    /// Start a process; its stdout and stderr are appended to `log`
    fn create_process(&self, system: u64, params: &str, log: Option<&Path>) -> Result<HcsProcess>;
    /// Raw JSON process properties
    fn process_properties(&self, process: u64) -> Result<String>;
    fn terminate_process(&self, process: u64) -> Result<()>;
    fn close_process(&self, process: u64);
    /// Raw JSON answer to a property query
    fn system_properties(&self, system: u64, query: &str) -> Result<String>;
}

/// Read the exit state out of a process properties document
pub fn parse_process_status(properties: &str) -> Result<ProcessStatus> {
    let value: Value = serde_json::from_str(properties)?;
    let exited = value.get("Exited").and_then(Value::as_bool).unwrap_or(false);
    if !exited {
        return Ok(ProcessStatus::Running);
    }
    match value.get("ExitCode").and_then(Value::as_i64) {
        Some(code) => Ok(ProcessStatus::Exited(code as i32)),
        None => Err(Error::ContainerError(
            "process reported exited without an exit code".to_string(),
        )),
    }
}

/// Compute system document for a container
pub fn compute_system_config(
    id: &str,
    options: &ContainerOptions,
    chain: &VhdxChain,
    shares: &[BindMount],
) -> Value {
    let mut memory_mb = options.vm.memory_mb;
    if let Some(max) = options.limits.memory_max {
        memory_mb = memory_mb.min((max / (1024 * 1024)).max(256) as u32);
    }
    let mut processor = json!({ "Count": options.vm.cpu_count });
    if let Some(rate) = JobLimits::from_limits(&options.limits).cpu_rate {
        processor["Limit"] = json!(rate);
    }

    let chipset = match options.windows.rootfs_type {
        WindowsRootfsType::Lcow => json!({
            "LinuxKernelDirect": {
                "KernelFilePath": options.windows.lcow_kernel.as_ref().map(|p| p.display().to_string()),
                "InitRdPath": options.windows.lcow_initrd.as_ref().map(|p| p.display().to_string()),
                "KernelCmdLine": "console=ttyS0 root=/dev/sda rw",
            }
        }),
        _ => json!({
            "Uefi": {
                "BootThis": {
                    "DevicePath": "Primary disk",
                    "DiskNumber": 0,
                    "DeviceType": "ScsiDrive",
                }
            }
        }),
    };

    let mut devices = json!({
        "Scsi": {
            "Primary disk": {
                "Attachments": {
                    "0": { "Type": "VirtualDisk", "Path": chain.scratch.display().to_string() }
                }
            }
        }
    });

    if let Some(network) = &options.network {
        devices["NetworkAdapters"] = json!({
            "nic0": {
                "EndpointId": uuid::Uuid::new_v4().to_string(),
                "SwitchName": network.switch_name,
                "IpAddress": network.container_ip.to_string(),
                "Netmask": network.netmask.to_string(),
                "Gateway": network.gateway.to_string(),
                "DnsServers": network.dns.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            }
        });
    }

    if !shares.is_empty() {
        let shares: Vec<Value> = shares
            .iter()
            .enumerate()
            .map(|(i, share)| {
                json!({
                    "Name": format!("share{i}"),
                    "AccessName": share.target.display().to_string(),
                    "Path": share.source.display().to_string(),
                    "Port": PLAN9_PORT,
                    // 1 = read only
                    "Flags": if share.writable { 0 } else { 1 },
                })
            })
            .collect();
        devices["Plan9"] = json!({ "Shares": shares });
    }

    json!({
        "Owner": "bake",
        "SchemaVersion": { "Major": 2, "Minor": 1 },
        "ShouldTerminateOnLastHandleClosed": true,
        "VirtualMachine": {
            "StopOnReset": true,
            "Chipset": chipset,
            "ComputeTopology": {
                "Memory": { "SizeInMB": memory_mb, "AllowOvercommit": true },
                "Processor": processor,
            },
            "Devices": devices,
            "GuestState": {
                "Hostname": options.hostname,
                "Isolation": options.windows.isolation.as_str(),
                "OsVersion": options.windows.version,
            },
        },
        "Id": id,
    })
}

/// Process parameters document for `spec`
pub fn process_params(spec: &SpawnSpec, default_cwd: &str) -> Value {
    let environment: serde_json::Map<String, Value> = spec
        .env
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    json!({
        "CommandLine": command_line(spec),
        "WorkingDirectory": spec
            .cwd
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| default_cwd.to_string()),
        "Environment": environment,
        "CreateStdInPipe": false,
        "CreateStdOutPipe": true,
        "CreateStdErrPipe": true,
        "EmulateConsole": false,
    })
}

/// Quote arguments the way `CommandLineToArgvW` splits them
fn command_line(spec: &SpawnSpec) -> String {
    std::iter::once(spec.path.as_str())
        .chain(spec.args.iter().map(String::as_str))
        .map(|arg| {
            if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
                arg.to_string()
            } else {
                format!("\"{}\"", arg.replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_statistics(text: &str) -> Result<ResourceStats> {
    let value: Value = serde_json::from_str(text)?;
    let stats = &value["Statistics"];
    Ok(ResourceStats {
        memory_bytes: stats["Memory"]["MemoryUsageCommitBytes"].as_u64().unwrap_or(0),
        // 100ns units
        cpu_time_us: stats["Processor"]["TotalRuntime100ns"].as_u64().unwrap_or(0) / 10,
        process_count: value["ProcessList"].as_array().map(Vec::len).unwrap_or(0),
    })
}

fn parse_process_list(text: &str) -> Result<Vec<ProcessInfo>> {
    let value: Value = serde_json::from_str(text)?;
    let Some(list) = value["ProcessList"].as_array() else {
        return Ok(Vec::new());
    };
    Ok(list
        .iter()
        .map(|p| ProcessInfo {
            pid: p["ProcessId"].as_u64().unwrap_or(0) as u32,
            name: p["ImageName"].as_str().unwrap_or_default().to_string(),
            rss_bytes: p["MemoryWorkingSetPrivateBytes"].as_u64().unwrap_or(0),
            // HCS reports no rate, only totals
            cpu_percent: 0.0,
        })
        .collect())
}

pub struct HcsRuntime<A: HcsApi + 'static> {
    api: Arc<A>,
    disks: Arc<dyn DiskTool>,
    cache_dir: PathBuf,
}

impl<A: HcsApi + 'static> HcsRuntime<A> {
    pub fn new(api: A) -> Self {
        Self::with_disks(
            api,
            Arc::new(vhdx::PowerShellDiskTool::default()),
            vhdx::default_cache_dir(),
        )
    }

    pub fn with_disks(api: A, disks: Arc<dyn DiskTool>, cache_dir: PathBuf) -> Self {
        Self {
            api: Arc::new(api),
            disks,
            cache_dir,
        }
    }
}

impl<A: HcsApi + 'static> ContainerRuntime for HcsRuntime<A> {
    fn name(&self) -> &'static str {
        "hcs"
    }

    fn create(&self, id: &str, options: ContainerOptions) -> Result<Box<dyn Container>> {
        let root = options.staging_dir.clone();
        let lock = RootfsLock::acquire(&root)?;
        std::fs::create_dir_all(root.join("chef"))?;

        let chain = vhdx::prepare_layers(
            self.disks.as_ref(),
            &self.cache_dir,
            &root,
            &options.layers,
            options.windows.rootfs_type,
        )?;

        let chef_root = match options.windows.rootfs_type {
            WindowsRootfsType::WindowsVm => "C:\\chef",
            WindowsRootfsType::Lcow | WindowsRootfsType::Wsl => "/chef",
        };
        // the chef tree is shared from the staging directory
        let mut shares = host_mounts(&options.layers);
        shares.push(BindMount {
            source: root.join("chef"),
            target: PathBuf::from(chef_root),
            writable: true,
        });

        let config = compute_system_config(id, &options, &chain, &shares);
        debug!("HCS config for {}: {}", id, config);
        let system = self.api.create_system(id, &config.to_string())?;
        if let Err(e) = self.api.start_system(system) {
            let _ = self.api.close_system(system);
            return Err(e);
        }

        info!("Started compute system {} ({})", id, options.windows.isolation.as_str());
        Ok(Box::new(HcsContainer {
            id: id.to_string(),
            api: Arc::clone(&self.api),
            system,
            root,
            chef_root: chef_root.to_string(),
            chain,
            processes: HashMap::new(),
            wait_timeout: options.wait_timeout,
            _lock: lock,
        }))
    }
}

struct HcsContainer<A: HcsApi> {
    id: String,
    api: Arc<A>,
    system: u64,
    root: PathBuf,
    chef_root: String,
    chain: VhdxChain,
    /// pid -> process handle
    processes: HashMap<u32, u64>,
    wait_timeout: Option<Duration>,
    _lock: RootfsLock,
}

impl<A: HcsApi> Container for HcsContainer<A> {
    fn id(&self) -> &str {
        &self.id
    }

    fn rootfs(&self) -> &Path {
        &self.root
    }

    fn chef_root(&self) -> PathBuf {
        PathBuf::from(&self.chef_root)
    }

    fn spawn(&mut self, spec: &SpawnSpec) -> Result<ProcessHandle> {
        let params = process_params(spec, &self.chef_root);
        debug!("[{}] spawn {}", self.id, spec.command_line());
        let process =
            self.api
                .create_process(self.system, &params.to_string(), spec.log.as_deref())?;
        self.processes.insert(process.pid, process.handle);

        let mut handle = ProcessHandle::new(process.pid);
        if spec.flags.contains(SpawnFlags::WAIT) {
            self.wait(&mut handle)?;
        }
        Ok(handle)
    }

    fn try_wait(&mut self, handle: &mut ProcessHandle) -> Result<Option<i32>> {
        if let Some(code) = handle.exit_code {
            return Ok(Some(code));
        }
        let Some(&process) = self.processes.get(&handle.pid) else {
            return Err(Error::NotFound(format!("process {}", handle.pid)));
        };
        match parse_process_status(&self.api.process_properties(process)?)? {
            ProcessStatus::Running => Ok(None),
            ProcessStatus::Exited(code) => {
                self.api.close_process(process);
                self.processes.remove(&handle.pid);
                handle.exit_code = Some(code);
                Ok(Some(code))
            }
        }
    }

    fn wait(&mut self, handle: &mut ProcessHandle) -> Result<i32> {
        let timeout = self.wait_timeout;
        wait_with_timeout(self, handle, timeout, POLL_INTERVAL)
    }

    fn kill(&mut self, handle: &ProcessHandle) -> Result<()> {
        if let Some(process) = self.processes.remove(&handle.pid) {
            let result = self.api.terminate_process(process);
            self.api.close_process(process);
            result?;
        }
        Ok(())
    }

    fn stats_source(&self) -> StatsSource {
        StatsSource::None
    }

    fn stats(&self) -> Result<ResourceStats> {
        let text = self.api.system_properties(self.system, STATISTICS_QUERY)?;
        let mut stats = parse_statistics(&text)?;
        stats.process_count = self.processes()?.len();
        Ok(stats)
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        parse_process_list(&self.api.system_properties(self.system, PROCESS_LIST_QUERY)?)
    }

    fn destroy(mut self: Box<Self>) -> Result<()> {
        for (pid, process) in self.processes.drain() {
            debug!("Terminating leftover process {}", pid);
            let _ = self.api.terminate_process(process);
            self.api.close_process(process);
        }
        self.api.close_system(self.system)?;
        // only the per-build disk is private; cached parents stay
        if let Err(e) = std::fs::remove_file(&self.chain.scratch) {
            warn!("Failed to remove {}: {}", self.chain.scratch.display(), e);
        }
        info!("Destroyed compute system {}", self.id);
        Ok(())
    }
}

#[cfg(windows)]
pub use self::compute_core::ComputeCore;

#[cfg(windows)]
mod compute_core {
    //! `vmcompute.dll` bindings
    //!
    //! Every HCS call is asynchronous; each one gets its own operation
    //! which is waited on synchronously.

    use super::*;
    use std::fs::OpenOptions;
    use std::os::windows::io::FromRawHandle;
    use std::sync::Mutex;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::HostComputeSystem::{
        HCS_OPERATION, HCS_PROCESS, HCS_PROCESS_INFORMATION, HCS_SYSTEM, HcsCloseComputeSystem,
        HcsCloseOperation, HcsCloseProcess, HcsCreateComputeSystem, HcsCreateOperation,
        HcsCreateProcess, HcsGetComputeSystemProperties, HcsGetProcessProperties,
        HcsStartComputeSystem, HcsTerminateComputeSystem, HcsTerminateProcess,
        HcsWaitForOperationResult, HcsWaitForOperationResultAndProcessInfo,
    };
    use windows::core::{HSTRING, PCWSTR, PWSTR};

    /// Synchronous wait on a single HCS operation
    const OPERATION_TIMEOUT_MS: u32 = 5 * 60 * 1000;

    fn hcs_err(what: &str, e: windows::core::Error) -> Error {
        Error::ContainerError(format!("{what}: {e}"))
    }

    fn take_result(result: PWSTR) -> String {
        if result.is_null() {
            return String::new();
        }
        // SAFETY: HCS returns a NUL-terminated wide string
        unsafe { result.to_string() }.unwrap_or_default()
    }

    struct Operation(HCS_OPERATION);

    impl Operation {
        fn new() -> Self {
            // SAFETY: no context, no callback; waited on synchronously
            Operation(unsafe { HcsCreateOperation(None, None) })
        }

        fn wait(&self, what: &str) -> Result<String> {
            // SAFETY: operation is live until drop
            unsafe { HcsWaitForOperationResult(self.0, OPERATION_TIMEOUT_MS) }
                .map(take_result)
                .map_err(|e| hcs_err(what, e))
        }
    }

    impl Drop for Operation {
        fn drop(&mut self) {
            // SAFETY: created by HcsCreateOperation and closed once
            unsafe { HcsCloseOperation(self.0) };
        }
    }

    #[derive(Default)]
    pub struct ComputeCore {
        systems: Mutex<HashMap<u64, HCS_SYSTEM>>,
        processes: Mutex<HashMap<u64, HCS_PROCESS>>,
    }

    // HCS handles may be used from any thread
    unsafe impl Send for ComputeCore {}
    unsafe impl Sync for ComputeCore {}

    impl ComputeCore {
        pub fn new() -> Self {
            Self::default()
        }

        fn system(&self, handle: u64) -> Result<HCS_SYSTEM> {
            self.systems
                .lock()
                .map_err(|_| Error::Fatal("HCS handle table poisoned".to_string()))?
                .get(&handle)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("compute system {handle}")))
        }

        fn process(&self, handle: u64) -> Result<HCS_PROCESS> {
            self.processes
                .lock()
                .map_err(|_| Error::Fatal("HCS handle table poisoned".to_string()))?
                .get(&handle)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("process {handle}")))
        }
    }

    /// Copy a pipe into the log until the guest closes it
    fn drain_pipe(pipe: HANDLE, log: Option<PathBuf>) {
        if pipe.is_invalid() {
            return;
        }
        // SAFETY: HCS hands over ownership of the pipe handle
        let mut reader = unsafe { std::fs::File::from_raw_handle(pipe.0 as *mut std::ffi::c_void) };
        std::thread::spawn(move || {
            let result = match log {
                Some(path) => OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut file| std::io::copy(&mut reader, &mut file)),
                None => std::io::copy(&mut reader, &mut std::io::sink()),
            };
            if let Err(e) = result {
                debug!("Pipe copy ended: {}", e);
            }
        });
    }

    impl HcsApi for ComputeCore {
        fn create_system(&self, id: &str, config: &str) -> Result<u64> {
            let op = Operation::new();
            let id_w = HSTRING::from(id);
            let config_w = HSTRING::from(config);
            // SAFETY: strings outlive the call; default security descriptor
            let system = unsafe {
                HcsCreateComputeSystem(PCWSTR(id_w.as_ptr()), PCWSTR(config_w.as_ptr()), op.0, None)
            }
            .map_err(|e| hcs_err("HcsCreateComputeSystem", e))?;
            op.wait("HcsCreateComputeSystem")?;
            let handle = system.0 as u64;
            self.systems
                .lock()
                .map_err(|_| Error::Fatal("HCS handle table poisoned".to_string()))?
                .insert(handle, system);
            Ok(handle)
        }

        fn start_system(&self, system: u64) -> Result<()> {
            let system = self.system(system)?;
            let op = Operation::new();
            // SAFETY: live system handle, no options
            unsafe { HcsStartComputeSystem(system, op.0, PCWSTR::null()) }
                .map_err(|e| hcs_err("HcsStartComputeSystem", e))?;
            op.wait("HcsStartComputeSystem").map(|_| ())
        }

        fn close_system(&self, handle: u64) -> Result<()> {
            let system = self
                .systems
                .lock()
                .map_err(|_| Error::Fatal("HCS handle table poisoned".to_string()))?
                .remove(&handle)
                .ok_or_else(|| Error::NotFound(format!("compute system {handle}")))?;
            let op = Operation::new();
            // SAFETY: live system handle; termination of a stopped system fails harmlessly
            if unsafe { HcsTerminateComputeSystem(system, op.0, PCWSTR::null()) }.is_ok() {
                let _ = op.wait("HcsTerminateComputeSystem");
            }
            // SAFETY: handle removed from the table, closed once
            unsafe { HcsCloseComputeSystem(system) };
            Ok(())
        }

        fn create_process(&self, system: u64, params: &str, log: Option<&Path>) -> Result<HcsProcess> {
            let system = self.system(system)?;
            let op = Operation::new();
            let params_w = HSTRING::from(params);
            // SAFETY: params outlive the call
            let process = unsafe { HcsCreateProcess(system, PCWSTR(params_w.as_ptr()), op.0, None) }
                .map_err(|e| hcs_err("HcsCreateProcess", e))?;
            let mut info = HCS_PROCESS_INFORMATION::default();
            // SAFETY: info is a valid out pointer
            unsafe {
                HcsWaitForOperationResultAndProcessInfo(op.0, OPERATION_TIMEOUT_MS, Some(&mut info))
            }
            .map_err(|e| hcs_err("HcsCreateProcess", e))?;

            drain_pipe(info.StdOutput, log.map(Path::to_path_buf));
            drain_pipe(info.StdError, log.map(Path::to_path_buf));

            let handle = process.0 as u64;
            self.processes
                .lock()
                .map_err(|_| Error::Fatal("HCS handle table poisoned".to_string()))?
                .insert(handle, process);
            Ok(HcsProcess {
                handle,
                pid: info.ProcessId,
            })
        }

        fn process_properties(&self, process: u64) -> Result<String> {
            let process = self.process(process)?;
            let op = Operation::new();
            // SAFETY: live process handle; default property query
            unsafe { HcsGetProcessProperties(process, op.0, PCWSTR::null()) }
                .map_err(|e| hcs_err("HcsGetProcessProperties", e))?;
            op.wait("HcsGetProcessProperties")
        }

        fn terminate_process(&self, process: u64) -> Result<()> {
            let process = self.process(process)?;
            let op = Operation::new();
            // SAFETY: live process handle
            unsafe { HcsTerminateProcess(process, op.0, PCWSTR::null()) }
                .map_err(|e| hcs_err("HcsTerminateProcess", e))?;
            op.wait("HcsTerminateProcess").map(|_| ())
        }

        fn close_process(&self, handle: u64) {
            let removed = self
                .processes
                .lock()
                .ok()
                .and_then(|mut table| table.remove(&handle));
            if let Some(process) = removed {
                // SAFETY: handle removed from the table, closed once
                unsafe { HcsCloseProcess(process) };
            }
        }

        fn system_properties(&self, system: u64, query: &str) -> Result<String> {
            let system = self.system(system)?;
            let op = Operation::new();
            let query_w = HSTRING::from(query);
            // SAFETY: query outlives the call
            unsafe { HcsGetComputeSystemProperties(system, op.0, PCWSTR(query_w.as_ptr())) }
                .map_err(|e| hcs_err("HcsGetComputeSystemProperties", e))?;
            op.wait("HcsGetComputeSystemProperties")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ResourceLimits;
    use crate::layers::Layer;
    use crate::layers::vhdx::tests::FakeDiskTool;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Processes exit after a fixed number of polls
    #[derive(Default)]
    struct MockHcs {
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        next: u64,
        configs: Vec<String>,
        closed_systems: Vec<u64>,
        /// handle -> (remaining polls, exit code)
        processes: HashMap<u64, (u32, i32)>,
        terminated: Vec<u64>,
        exit_code: i32,
        polls_before_exit: u32,
    }

    impl MockHcs {
        fn exiting(code: i32, polls: u32) -> Self {
            let mock = Self::default();
            {
                let mut state = mock.state.lock().unwrap();
                state.exit_code = code;
                state.polls_before_exit = polls;
            }
            mock
        }
    }

    impl HcsApi for Arc<MockHcs> {
        fn create_system(&self, _id: &str, config: &str) -> Result<u64> {
            let mut state = self.state.lock().unwrap();
            state.next += 1;
            state.configs.push(config.to_string());
            Ok(state.next)
        }

        fn start_system(&self, _system: u64) -> Result<()> {
            Ok(())
        }

        fn close_system(&self, system: u64) -> Result<()> {
            self.state.lock().unwrap().closed_systems.push(system);
            Ok(())
        }

        fn create_process(&self, _system: u64, _params: &str, log: Option<&Path>) -> Result<HcsProcess> {
            let mut state = self.state.lock().unwrap();
            state.next += 1;
            let handle = state.next;
            let entry = (state.polls_before_exit, state.exit_code);
            state.processes.insert(handle, entry);
            if let Some(log) = log {
                std::fs::write(log, "guest output\n").unwrap();
            }
            Ok(HcsProcess {
                handle,
                pid: 1000 + handle as u32,
            })
        }

        fn process_properties(&self, process: u64) -> Result<String> {
            let mut state = self.state.lock().unwrap();
            let (remaining, code) = state
                .processes
                .get_mut(&process)
                .ok_or_else(|| Error::NotFound(format!("process {process}")))?;
            if *remaining == 0 {
                return Ok(format!(r#"{{"ProcessId":1,"Exited":true,"ExitCode":{code}}}"#));
            }
            *remaining -= 1;
            Ok(r#"{"ProcessId":1,"Exited":false}"#.to_string())
        }

        fn terminate_process(&self, process: u64) -> Result<()> {
            self.state.lock().unwrap().terminated.push(process);
            Ok(())
        }

        fn close_process(&self, _process: u64) {}

        fn system_properties(&self, _system: u64, query: &str) -> Result<String> {
            if query.contains("Statistics") {
                Ok(r#"{"Statistics":{"Memory":{"MemoryUsageCommitBytes":4096},"Processor":{"TotalRuntime100ns":50}}}"#.to_string())
            } else {
                Ok(r#"{"ProcessList":[{"ProcessId":4,"ImageName":"cmd.exe","MemoryWorkingSetPrivateBytes":100}]}"#.to_string())
            }
        }
    }

    fn runtime(mock: &Arc<MockHcs>, dir: &Path) -> HcsRuntime<Arc<MockHcs>> {
        HcsRuntime::with_disks(
            Arc::clone(mock),
            Arc::new(FakeDiskTool::default()),
            dir.join("cache"),
        )
    }

    fn options(dir: &Path) -> ContainerOptions {
        let base = dir.join("base");
        std::fs::create_dir_all(&base).unwrap();
        ContainerOptions::new(dir.join("stage")).with_layers(vec![Layer::BaseRootfs { source: base }])
    }

    #[test]
    fn test_parse_process_status() {
        assert_eq!(
            parse_process_status(r#"{"Exited":false}"#).unwrap(),
            ProcessStatus::Running
        );
        assert_eq!(
            parse_process_status(r#"{"Exited":true,"ExitCode":3}"#).unwrap(),
            ProcessStatus::Exited(3)
        );
        assert!(parse_process_status(r#"{"Exited":true}"#).is_err());
        assert!(parse_process_status("not json").is_err());
    }

    #[test]
    fn test_config_document() {
        let dir = TempDir::new().unwrap();
        let chain = VhdxChain {
            base: dir.path().join("base.vhdx"),
            layers: Vec::new(),
            scratch: dir.path().join("scratch.vhdx"),
        };
        let opts = options(dir.path()).with_limits(ResourceLimits {
            memory_max: Some(1 << 30),
            cpu_percent: Some(50),
            process_count: None,
        });
        let shares = vec![BindMount {
            source: PathBuf::from("C:\\src"),
            target: PathBuf::from("C:\\chef\\project"),
            writable: false,
        }];
        let config = compute_system_config("c1", &opts, &chain, &shares);
        let vm = &config["VirtualMachine"];
        assert_eq!(vm["ComputeTopology"]["Memory"]["SizeInMB"], 1024);
        assert_eq!(vm["ComputeTopology"]["Processor"]["Count"], 2);
        assert_eq!(vm["ComputeTopology"]["Processor"]["Limit"], 5000);
        assert_eq!(
            vm["Devices"]["Scsi"]["Primary disk"]["Attachments"]["0"]["Path"],
            chain.scratch.display().to_string()
        );
        assert_eq!(vm["Devices"]["Plan9"]["Shares"][0]["Flags"], 1);
        assert!(vm["Devices"].get("NetworkAdapters").is_none());
    }

    #[test]
    fn test_command_line_quoting() {
        let spec = SpawnSpec::new("cmd.exe").args(["/c", "echo hello world", ""]);
        assert_eq!(command_line(&spec), r#"cmd.exe /c "echo hello world" """#);
        let params = process_params(&spec, "C:\\chef");
        assert_eq!(params["WorkingDirectory"], "C:\\chef");
        assert_eq!(params["CreateStdOutPipe"], true);
    }

    #[test]
    fn test_spawn_waits_for_real_exit_code() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockHcs::exiting(7, 2));
        let mut container = runtime(&mock, dir.path())
            .create("c1", options(dir.path()))
            .unwrap();
        assert_eq!(container.chef_root(), PathBuf::from("C:\\chef"));

        let log = dir.path().join("build.log");
        let handle = container
            .spawn(&SpawnSpec::new("cmd.exe").log(&log).wait())
            .unwrap();
        assert_eq!(handle.exit_code, Some(7));
        assert!(log.exists());

        let stats = container.stats().unwrap();
        assert_eq!(stats.memory_bytes, 4096);
        assert_eq!(stats.cpu_time_us, 5);
        assert_eq!(stats.process_count, 1);
        assert_eq!(container.processes().unwrap()[0].name, "cmd.exe");

        container.destroy().unwrap();
        assert_eq!(mock.state.lock().unwrap().closed_systems.len(), 1);
    }

    #[test]
    fn test_wait_timeout_terminates() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockHcs::exiting(0, u32::MAX));
        let mut opts = options(dir.path());
        opts.wait_timeout = Some(Duration::from_millis(300));
        let mut container = runtime(&mock, dir.path()).create("c2", opts).unwrap();

        let mut handle = container.spawn(&SpawnSpec::new("cmd.exe")).unwrap();
        let err = container.wait(&mut handle).unwrap_err();
        assert!(matches!(err, Error::ContainerError(_)));
        assert_eq!(mock.state.lock().unwrap().terminated.len(), 1);
        container.destroy().unwrap();
    }
}
