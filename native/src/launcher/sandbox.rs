// OS restrictions applied to sandboxed installer processes.
//
// Windows: the process joins a job object that kills it with the host, forbids child
// processes and keeps it off the interactive desktop.
// Unix: own session, no privilege gain, no core dumps, bounded file size and descriptor count.

use serde::{Deserialize, Serialize};
use std::io;

/// Resource ceilings applied on unix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_file_bytes: u64,
    pub max_open_files: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 16 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

/// Keeps a platform confinement alive for as long as the supervised process runs.
#[cfg(windows)]
pub struct Confinement(windows::Win32::Foundation::HANDLE);

#[cfg(not(windows))]
pub struct Confinement;

// The job handle is only closed on drop.
#[cfg(windows)]
unsafe impl Send for Confinement {}

#[cfg(windows)]
impl Drop for Confinement {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(self.0);
        }
    }
}

/// Install the pre-exec hook. Spawning fails if any restriction cannot be applied.
#[cfg(unix)]
pub fn restrict(command: &mut tokio::process::Command, limits: &SandboxLimits) {
    let limits = *limits;
    unsafe {
        command.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            #[cfg(target_os = "linux")]
            {
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            lower_limit(libc::RLIMIT_CORE, 0)?;
            lower_limit(libc::RLIMIT_FSIZE, limits.max_file_bytes)?;
            lower_limit(libc::RLIMIT_NOFILE, limits.max_open_files)?;
            Ok(())
        });
    }
}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;

#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type Resource = libc::c_int;

// Runs between fork and exec: no allocation, no locks.
#[cfg(unix)]
fn lower_limit(resource: Resource, value: u64) -> io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let ceiling = (value as libc::rlim_t).min(current.rlim_max);
    let limit = libc::rlimit {
        rlim_cur: ceiling,
        rlim_max: ceiling,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Move a freshly spawned process into a restricted job object.
#[cfg(windows)]
pub fn confine(child: &tokio::process::Child) -> io::Result<Confinement> {
    use std::ffi::c_void;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectBasicUIRestrictions,
        JobObjectExtendedLimitInformation, SetInformationJobObject,
        JOBOBJECT_BASIC_UI_RESTRICTIONS, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_ACTIVE_PROCESS, JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_UILIMIT_DESKTOP,
        JOB_OBJECT_UILIMIT_DISPLAYSETTINGS, JOB_OBJECT_UILIMIT_EXITWINDOWS,
        JOB_OBJECT_UILIMIT_GLOBALATOMS, JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS,
    };

    let raw = child
        .raw_handle()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "process handle unavailable"))?;

    unsafe {
        let job = CreateJobObjectW(None, PCWSTR::null()).map_err(io::Error::from)?;
        let confinement = Confinement(job);

        let mut limits = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE
            | JOB_OBJECT_LIMIT_ACTIVE_PROCESS
            | JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION;
        limits.BasicLimitInformation.ActiveProcessLimit = 1;
        SetInformationJobObject(
            job,
            JobObjectExtendedLimitInformation,
            &limits as *const _ as *const c_void,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
        .map_err(io::Error::from)?;

        let ui = JOBOBJECT_BASIC_UI_RESTRICTIONS {
            UIRestrictionsClass: JOB_OBJECT_UILIMIT_DESKTOP
                | JOB_OBJECT_UILIMIT_DISPLAYSETTINGS
                | JOB_OBJECT_UILIMIT_EXITWINDOWS
                | JOB_OBJECT_UILIMIT_GLOBALATOMS
                | JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS,
        };
        SetInformationJobObject(
            job,
            JobObjectBasicUIRestrictions,
            &ui as *const _ as *const c_void,
            std::mem::size_of::<JOBOBJECT_BASIC_UI_RESTRICTIONS>() as u32,
        )
        .map_err(io::Error::from)?;

        AssignProcessToJobObject(job, HANDLE(raw as _)).map_err(io::Error::from)?;
        Ok(confinement)
    }
}
