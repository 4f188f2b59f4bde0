// Lockfile-based single-instance guard

use crate::error::{MonitorError, Result};
use crate::paths;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// An exclusively locked pidfile held for the lifetime of the monitor.
///
/// The lock is advisory; a second monitor pointed at the same lockfile
/// fails to acquire it and reports [`MonitorError::LockfileBusy`].
pub struct Lockfile {
    path: PathBuf,
    lock: Flock<File>,
}

impl Lockfile {
    /// Open (creating parent directories as needed), lock, and write the
    /// monitor's pid into the file at `path`.
    pub fn acquire(path: &Path) -> Result<Self> {
        let resolved = paths::abspath(path).map_err(|e| {
            MonitorError::Startup(format!(
                "Unable to determine parent directory of lockfile {}: {}",
                path.display(),
                e
            ))
        })?;
        let dir = resolved.parent().ok_or_else(|| {
            MonitorError::Startup(format!(
                "Unable to determine parent directory of lockfile {}",
                path.display()
            ))
        })?;
        std::fs::create_dir_all(dir).map_err(|e| {
            MonitorError::Startup(format!(
                "Unable to create parent directory for lockfile {}: {}",
                path.display(),
                e
            ))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o640)
            .open(&resolved)
            .map_err(|e| {
                MonitorError::Startup(format!(
                    "Unable to open lockfile {}: {}",
                    resolved.display(),
                    e
                ))
            })?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(MonitorError::LockfileBusy(resolved));
            }
            Err((_, errno)) => {
                return Err(MonitorError::Startup(format!(
                    "Unable to lock lockfile {}: {}",
                    resolved.display(),
                    errno
                )));
            }
        };

        let mut lockfile = Self { path: resolved, lock };
        lockfile.write_pid()?;
        Ok(lockfile)
    }

    /// Write our pid to the lockfile for convenience.
    fn write_pid(&mut self) -> Result<()> {
        self.lock.set_len(0)?;
        let mut file: &File = &self.lock;
        write!(file, "{}\n", std::process::id())?;
        file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the lockfile on clean shutdown. The lock itself is released
    /// when the process exits.
    pub fn remove(self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitor.pid");

        let lockfile = Lockfile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(lockfile.path()).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));
    }

    #[test]
    fn test_acquire_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/run/monitor.pid");

        let lockfile = Lockfile::acquire(&path).unwrap();
        assert!(lockfile.path().exists());
    }

    #[test]
    fn test_second_acquire_reports_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitor.pid");

        let _held = Lockfile::acquire(&path).unwrap();
        match Lockfile::acquire(&path) {
            Err(MonitorError::LockfileBusy(_)) => {}
            other => panic!("expected LockfileBusy, got {:?}", other.map(|l| l.path().to_path_buf())),
        }
    }

    #[test]
    fn test_remove_unlinks_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitor.pid");

        let lockfile = Lockfile::acquire(&path).unwrap();
        let resolved = lockfile.path().to_path_buf();
        lockfile.remove().unwrap();
        assert!(!resolved.exists());
    }
}
