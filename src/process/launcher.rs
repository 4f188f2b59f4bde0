// Fork/exec sequence for launching one supervised child

use crate::config::SCRUBBED_ENV_VARS;
use crate::error::{MonitorError, Result};
use nix::libc;
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;

/// Everything the child-side sequence needs, prepared in the parent.
pub struct Launch<'a> {
    /// Executable path followed by arguments; must be non-empty
    pub argv: &'a [String],
    /// Write end of the stdout pipe
    pub stdout: RawFd,
    /// Write end of the stderr pipe
    pub stderr: RawFd,
    /// Target user to drop to before exec
    pub uid: Uid,
    /// Target group to drop to before exec
    pub gid: Gid,
    /// Seconds the child sleeps before exec
    pub delay_secs: u32,
    /// Remove the scrubbed environment variable set from the child
    pub scrub_env: bool,
}

// Messages the child can emit onto its own stderr pipe between fork and
// exec, where ordinary logging is off limits.
const SETGID_FAILED: &[u8] = b"fdbmonitor: unable to set gid for child process\n";
const SETUID_FAILED: &[u8] = b"fdbmonitor: unable to set uid for child process\n";
const EXEC_FAILED: &[u8] = b"fdbmonitor: unable to launch child process\n";

/// argv/envp as NUL-terminated arrays plus the signal mask to restore,
/// assembled before the fork so the child allocates nothing.
struct PreparedExec {
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    empty_mask: libc::sigset_t,
}

impl PreparedExec {
    fn new(launch: &Launch<'_>) -> Result<Self> {
        let argv: Vec<CString> = launch
            .argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| MonitorError::Spawn(format!("invalid argument: {}", e)))?;

        let envp: Vec<CString> = std::env::vars_os()
            .filter(|(key, _)| {
                !launch.scrub_env
                    || key
                        .to_str()
                        .map_or(true, |name| !SCRUBBED_ENV_VARS.contains(&name))
            })
            .filter_map(|(key, value)| {
                let mut bytes = key.as_bytes().to_vec();
                bytes.push(b'=');
                bytes.extend_from_slice(value.as_bytes());
                CString::new(bytes).ok()
            })
            .collect();

        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let empty_mask = unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            mask
        };

        Ok(Self {
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            empty_mask,
        })
    }
}

/// Fork and exec one child.
///
/// On success the child is sleeping out its pre-start delay (or already
/// running) with its stdio wired to the pipes.
///
/// # Arguments
/// * `launch` - Prepared launch parameters for the child
///
/// # Returns
/// * `Ok(Pid)` - The child's pid, for the registry
/// * `Err(MonitorError)` - Fork failed or argv could not be prepared
pub fn spawn_child(launch: &Launch<'_>) -> Result<Pid> {
    if launch.argv.is_empty() {
        return Err(MonitorError::Spawn("empty argv".to_string()));
    }
    let prepared = PreparedExec::new(launch)?;

    // SAFETY: the child branch only makes async-signal-safe calls (raw
    // signal/dup2/sleep/setgid/setuid/execve) on memory prepared before the
    // fork, then replaces the process image.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => unsafe { exec_child(launch, &prepared) },
        Err(e) => Err(MonitorError::Spawn(format!("fork: {}", e))),
    }
}

unsafe fn exec_child(launch: &Launch<'_>, prepared: &PreparedExec) -> ! {
    // Remove the monitor's signal handlers
    libc::signal(libc::SIGHUP, libc::SIG_DFL);
    libc::signal(libc::SIGINT, libc::SIG_DFL);
    libc::signal(libc::SIGTERM, libc::SIG_DFL);

    libc::dup2(launch.stdout, libc::STDOUT_FILENO);
    libc::dup2(launch.stderr, libc::STDERR_FILENO);

    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    libc::sigprocmask(libc::SIG_SETMASK, &prepared.empty_mask, std::ptr::null_mut());

    // Death of the monitor raises SIGHUP in the child
    #[cfg(target_os = "linux")]
    {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP as libc::c_ulong);
        if libc::getppid() == 1 {
            // Parent already died before prctl
            libc::_exit(0);
        }
    }

    let mut remaining = launch.delay_secs;
    while remaining > 0 {
        remaining = libc::sleep(remaining);
    }

    if libc::getegid() != launch.gid.as_raw() && libc::setgid(launch.gid.as_raw()) != 0 {
        libc::write(
            libc::STDERR_FILENO,
            SETGID_FAILED.as_ptr().cast(),
            SETGID_FAILED.len(),
        );
        libc::_exit(1);
    }
    if libc::geteuid() != launch.uid.as_raw() && libc::setuid(launch.uid.as_raw()) != 0 {
        libc::write(
            libc::STDERR_FILENO,
            SETUID_FAILED.as_ptr().cast(),
            SETUID_FAILED.len(),
        );
        libc::_exit(1);
    }

    // Setting uid/gid clears the parent-death signal; arm it again and
    // re-check for a parent that died in between
    #[cfg(target_os = "linux")]
    {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP as libc::c_ulong);
        if libc::getppid() == 1 {
            libc::_exit(0);
        }
    }

    libc::execve(
        prepared.argv_ptrs[0],
        prepared.argv_ptrs.as_ptr(),
        prepared.envp_ptrs.as_ptr(),
    );
    libc::write(libc::STDERR_FILENO, EXEC_FAILED.as_ptr().cast(), EXEC_FAILED.len());
    libc::_exit(127);
}
