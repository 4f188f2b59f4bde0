// Backgrounding for --daemonize

use crate::error::{MonitorError, Result};
use nix::libc;
use nix::unistd::setsid;

/// Detach the monitor from the terminal.
///
/// After this returns the process is a child of init with stdio reopened
/// on /dev/null, so children forked later inherit no terminal. Must run
/// before the runtime starts and before the syslog connection is opened.
pub fn daemonize() -> Result<()> {
    // daemon(3): fork into the background, start a new session, reopen
    // stdio on /dev/null
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(MonitorError::Startup(format!(
            "Unable to background the monitor: {}",
            std::io::Error::last_os_error()
        )));
    }

    // Job-control stops have no meaning without a terminal
    unsafe {
        libc::signal(libc::SIGTSTP, libc::SIG_IGN);
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
    }

    // Unchecked: the only failure means we already lead a process group
    let _ = setsid();

    Ok(())
}
