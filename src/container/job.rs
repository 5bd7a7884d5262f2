// src/container/job.rs

//! Windows job object limits
//!
//! The limit values are computed on every platform so they can be checked
//! anywhere; the job object itself only exists on Windows.

use crate::container::limits::ResourceLimits;
use crate::error::{Error, Result};
use std::process::Child;

/// Settings applied to a job object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub memory_bytes: Option<u64>,
    /// CPU rate in 1/100 of a percent, as the job object API expects
    pub cpu_rate: Option<u32>,
    pub active_processes: Option<u32>,
    /// Deny desktop, clipboard and global atom access
    pub ui_restrictions: bool,
    /// Kill every process when the last job handle closes
    pub kill_on_close: bool,
}

impl JobLimits {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            memory_bytes: limits.memory_max,
            cpu_rate: limits.cpu_percent.map(|p| u32::from(p.clamp(1, 100)) * 100),
            active_processes: limits
                .process_count
                .map(|n| n.min(u64::from(u32::MAX)) as u32),
            ui_restrictions: true,
            kill_on_close: true,
        }
    }
}

#[cfg(windows)]
pub use self::windows_job::JobObject;

#[cfg(not(windows))]
#[derive(Debug)]
pub struct JobObject;

#[cfg(not(windows))]
impl JobObject {
    pub fn create(_name: &str, _limits: &JobLimits) -> Result<Self> {
        Err(Error::ContainerError(
            "job objects are only available on Windows".to_string(),
        ))
    }

    pub fn assign(&self, _child: &Child) -> Result<()> {
        Ok(())
    }
}

#[cfg(windows)]
mod windows_job {
    use super::*;
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_CPU_RATE_CONTROL_ENABLE,
        JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP, JOB_OBJECT_LIMIT_ACTIVE_PROCESS,
        JOB_OBJECT_LIMIT_JOB_MEMORY, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        JOB_OBJECT_UILIMIT_DESKTOP, JOB_OBJECT_UILIMIT_DISPLAYSETTINGS,
        JOB_OBJECT_UILIMIT_EXITWINDOWS, JOB_OBJECT_UILIMIT_GLOBALATOMS,
        JOB_OBJECT_UILIMIT_HANDLES, JOB_OBJECT_UILIMIT_READCLIPBOARD,
        JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS, JOB_OBJECT_UILIMIT_WRITECLIPBOARD,
        JOBOBJECT_BASIC_UI_RESTRICTIONS, JOBOBJECT_CPU_RATE_CONTROL_INFORMATION,
        JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectBasicUIRestrictions,
        JobObjectCpuRateControlInformation, JobObjectExtendedLimitInformation,
        SetInformationJobObject,
    };
    use windows::core::HSTRING;

    fn win_err(what: &str, e: windows::core::Error) -> Error {
        Error::ContainerError(format!("{what}: {e}"))
    }

    #[derive(Debug)]
    pub struct JobObject {
        handle: HANDLE,
    }

    // The handle is only used through thread-safe kernel calls
    unsafe impl Send for JobObject {}

    impl JobObject {
        pub fn create(name: &str, limits: &JobLimits) -> Result<Self> {
            let name = HSTRING::from(format!("bake-{name}"));
            // SAFETY: no security attributes, valid name
            let handle = unsafe { CreateJobObjectW(None, &name) }
                .map_err(|e| win_err("CreateJobObjectW", e))?;
            let job = Self { handle };
            job.apply(limits)?;
            Ok(job)
        }

        fn set<T>(&self, class: windows::Win32::System::JobObjects::JOBOBJECTINFOCLASS, info: &T) -> Result<()> {
            // SAFETY: info points to a live struct of the size passed
            unsafe {
                SetInformationJobObject(
                    self.handle,
                    class,
                    info as *const T as *const std::ffi::c_void,
                    std::mem::size_of::<T>() as u32,
                )
            }
            .map_err(|e| win_err("SetInformationJobObject", e))
        }

        fn apply(&self, limits: &JobLimits) -> Result<()> {
            let mut extended = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            if limits.kill_on_close {
                extended.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            }
            if let Some(bytes) = limits.memory_bytes {
                extended.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_JOB_MEMORY;
                extended.JobMemoryLimit = bytes as usize;
            }
            if let Some(count) = limits.active_processes {
                extended.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
                extended.BasicLimitInformation.ActiveProcessLimit = count;
            }
            self.set(JobObjectExtendedLimitInformation, &extended)?;

            if let Some(rate) = limits.cpu_rate {
                let mut cpu = JOBOBJECT_CPU_RATE_CONTROL_INFORMATION::default();
                cpu.ControlFlags =
                    JOB_OBJECT_CPU_RATE_CONTROL_ENABLE | JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP;
                cpu.Anonymous.CpuRate = rate;
                self.set(JobObjectCpuRateControlInformation, &cpu)?;
            }

            if limits.ui_restrictions {
                let ui = JOBOBJECT_BASIC_UI_RESTRICTIONS {
                    UIRestrictionsClass: JOB_OBJECT_UILIMIT_DESKTOP
                        | JOB_OBJECT_UILIMIT_DISPLAYSETTINGS
                        | JOB_OBJECT_UILIMIT_EXITWINDOWS
                        | JOB_OBJECT_UILIMIT_GLOBALATOMS
                        | JOB_OBJECT_UILIMIT_HANDLES
                        | JOB_OBJECT_UILIMIT_READCLIPBOARD
                        | JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS
                        | JOB_OBJECT_UILIMIT_WRITECLIPBOARD,
                };
                self.set(JobObjectBasicUIRestrictions, &ui)?;
            }
            Ok(())
        }

        pub fn assign(&self, child: &Child) -> Result<()> {
            let process = HANDLE(child.as_raw_handle() as isize);
            // SAFETY: both handles are open for the duration of the call
            unsafe { AssignProcessToJobObject(self.handle, process) }
                .map_err(|e| win_err("AssignProcessToJobObject", e))
        }
    }

    impl Drop for JobObject {
        fn drop(&mut self) {
            // SAFETY: handle came from CreateJobObjectW and is closed once
            let _ = unsafe { CloseHandle(self.handle) };
        }
    }
}
