// The supervision engine: owns the registry and drives the event loop

pub mod reconcile;

use crate::config::{ConfigStore, ProcessCommand};
use crate::error::{MonitorError, Result};
use crate::process::{spawn_child, Launch, OutputPipes, ProcessRegistry, SupervisedProcess};
use crate::watcher::ConfigWatcher;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getegid, geteuid, Gid, Group, Pid, Uid, User};
use self::reconcile::{build_plan, LiveAction, ReconcilePlan};
use std::path::Path;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Owner of all supervision state. Lives on the event-loop stack and is
/// only ever touched from that one task.
pub struct Supervisor {
    registry: ProcessRegistry,
    uid: Uid,
    gid: Gid,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            registry: ProcessRegistry::new(),
            uid: geteuid(),
            gid: getegid(),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Run the supervision loop until a termination signal arrives.
    ///
    /// Event classes are dispatched in priority order: termination signals
    /// first, then SIGHUP, then configuration changes, then child exits.
    /// Child pipe output is forwarded by the per-pipe tasks the registry
    /// owns.
    pub async fn run(&mut self, watcher: &mut ConfigWatcher) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| MonitorError::Startup(format!("Unable to install SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| MonitorError::Startup(format!("Unable to install SIGINT handler: {}", e)))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| MonitorError::Startup(format!("Unable to install SIGHUP handler: {}", e)))?;
        let mut sigchld = signal(SignalKind::child())
            .map_err(|e| MonitorError::Startup(format!("Unable to install SIGCHLD handler: {}", e)))?;

        let initial = watcher.config_path().to_path_buf();
        self.load_configuration(&initial);

        loop {
            tokio::select! {
                biased;
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    self.shutdown();
                    return Ok(());
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    self.shutdown();
                    return Ok(());
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, doing nothing");
                }
                changed = watcher.changed() => {
                    let path = changed?;
                    self.load_configuration(&path);
                }
                _ = sigchld.recv() => {
                    self.reap_children();
                }
            }
        }
    }

    /// Load the configuration at `path` and reconcile the fleet with it.
    ///
    /// A parse failure or an unknown user/group aborts the reload and keeps
    /// the previous state.
    pub fn load_configuration(&mut self, path: &Path) {
        info!("Loading configuration {}", path.display());

        let store = match ConfigStore::load(path) {
            Ok(store) => store,
            Err(e) => {
                error!("Unable to load configuration file ({})", e);
                return;
            }
        };

        let (uid, gid) = match resolve_identity(&store) {
            Ok(identity) => identity,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        let identity_changed = (uid, gid) != (self.uid, self.gid);

        let plan = build_plan(&store, &self.registry, identity_changed);
        self.uid = uid;
        self.gid = gid;
        self.apply_plan(plan, &store);
    }

    fn apply_plan(&mut self, plan: ReconcilePlan, store: &ConfigStore) {
        // uid/gid changes take effect only through a restart
        for id in plan.identity_kills {
            self.kill_process(id);
            self.registry.remove(id);
        }

        let mut kill_and_remove = Vec::new();
        let mut kill_and_restart = Vec::new();

        for action in plan.actions {
            match action {
                LiveAction::Deconfigure { id, kill } => {
                    if let Some(entry) = self.registry.get_mut(id) {
                        info!("Deconfigured {}", entry.command.qualified);
                        entry.command.deconfigured = true;
                        if kill {
                            kill_and_remove.push(id);
                        }
                    }
                }
                LiveAction::Replace { id, fresh, restart } => {
                    info!("Found new configuration for {}", fresh.qualified);
                    match OutputPipes::new(&fresh.qualified) {
                        Ok(pipes) => {
                            self.registry.insert(id, SupervisedProcess { command: fresh, pipes });
                            if restart {
                                kill_and_restart.push(id);
                            }
                        }
                        Err(e) => error!("{}", e),
                    }
                }
                LiveAction::Update { id, fresh } => {
                    if let Some(entry) = self.registry.get_mut(id) {
                        info!("Updated configuration for {}", entry.command.qualified);
                        entry.command.update(&fresh);
                    }
                }
            }
        }

        // Kills complete before any launch
        for id in kill_and_remove {
            self.kill_process(id);
            self.registry.remove(id);
        }
        for &id in &kill_and_restart {
            self.kill_process(id);
        }
        for id in kill_and_restart {
            self.start_process(id, 0);
        }

        for (section, id) in plan.new_starts {
            info!("Starting {}.{}", section, id);
            let command = ProcessCommand::new(store, &section, id);
            match OutputPipes::new(&command.qualified) {
                Ok(pipes) => {
                    self.registry.insert(id, SupervisedProcess { command, pipes });
                    self.start_process(id, 0);
                }
                Err(e) => error!("{}", e),
            }
        }
    }

    /// Launch the child for `id` with the given pre-start delay.
    fn start_process(&mut self, id: u64, delay_secs: u32) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        // Commands that failed construction are not launchable
        let Some(argv) = entry.command.argv.clone().filter(|argv| !argv.is_empty()) else {
            return;
        };
        let quiet = entry.command.quiet;
        let qualified = entry.command.qualified.clone();
        let launch = Launch {
            argv: &argv,
            stdout: entry.pipes.stdout_fd(),
            stderr: entry.pipes.stderr_fd(),
            uid: self.uid,
            gid: self.gid,
            delay_secs,
            scrub_env: entry.command.delete_wd40_env,
        };

        match spawn_child(&launch) {
            Ok(pid) => {
                if let Some(entry) = self.registry.get_mut(id) {
                    entry.command.backoff.record_start(Instant::now(), delay_secs);
                }
                self.registry.bind(id, pid);
                if !quiet {
                    info!("Launching {} ({}) for {}", argv[0], pid, qualified);
                }
            }
            Err(e) => {
                // The registry is left unchanged; the instance is retried on
                // the next reconciliation or exit event
                error!("Failed to launch new {} process ({})", argv[0], e);
            }
        }
    }

    /// SIGTERM the child for `id` and wait for it synchronously, so that a
    /// subsequent relaunch cannot race the dying process.
    pub fn kill_process(&mut self, id: u64) {
        let Some(pid) = self.registry.pid_of(id) else {
            return;
        };
        info!("Killing process {}", pid);
        let _ = kill(pid, Signal::SIGTERM);
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
        self.registry.unbind(id);
    }

    /// Reap every child that has exited, restarting or discarding each one.
    pub fn reap_children(&mut self) {
        loop {
            let status = match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("Error while waiting for child process ({})", e);
                    break;
                }
            };
            let Some(pid) = status.pid() else {
                break;
            };
            self.handle_exit(pid, status);
        }
    }

    fn handle_exit(&mut self, pid: Pid, status: WaitStatus) {
        // Pids reaped synchronously by kill_process are already unbound and
        // not ours to handle
        let Some(id) = self.registry.unbind_pid(pid) else {
            return;
        };

        let deconfigured = match self.registry.get(id) {
            None => return,
            Some(entry) => entry.command.deconfigured,
        };
        if deconfigured {
            self.registry.remove(id);
            return;
        }

        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        let delay = entry.command.backoff.get_and_update(Instant::now());
        if !entry.command.quiet {
            let qualified = &entry.command.qualified;
            match status {
                WaitStatus::Exited(_, 0) => {
                    info!("Process {} exited 0, restarting {} in {} seconds", pid, qualified, delay);
                }
                WaitStatus::Exited(_, code) => {
                    error!(
                        "Process {} exited {}, restarting {} in {} seconds",
                        pid, code, qualified, delay
                    );
                }
                WaitStatus::Signaled(_, sig, _) => {
                    info!(
                        "Process {} terminated by signal {}, restarting {} in {} seconds",
                        pid,
                        sig.as_str(),
                        qualified,
                        delay
                    );
                }
                _ => {
                    warn!(
                        "Process {} exited for unknown reason, restarting {} in {} seconds",
                        pid, qualified, delay
                    );
                }
            }
        }

        self.start_process(id, delay);
    }

    /// Clean group shutdown: SIGHUP to the process group, then wait for
    /// every child to exit.
    fn shutdown(&mut self) {
        let _ = kill(Pid::from_raw(0), Signal::SIGHUP);
        loop {
            match waitpid(None::<Pid>, None) {
                Ok(_) => continue,
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Error while waiting for child processes ({})", e);
                    break;
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the target uid/gid from `fdbmonitor.user` / `fdbmonitor.group`.
/// Absent fields inherit the monitor's effective ids.
fn resolve_identity(store: &ConfigStore) -> Result<(Uid, Gid)> {
    let uid = match store.value("fdbmonitor", "user") {
        Some(name) => User::from_name(name)
            .map_err(|_| MonitorError::UnknownUser(name.to_string()))?
            .ok_or_else(|| MonitorError::UnknownUser(name.to_string()))?
            .uid,
        None => geteuid(),
    };
    let gid = match store.value("fdbmonitor", "group") {
        Some(name) => Group::from_name(name)
            .map_err(|_| MonitorError::UnknownGroup(name.to_string()))?
            .ok_or_else(|| MonitorError::UnknownGroup(name.to_string()))?
            .gid,
        None => getegid(),
    };
    Ok((uid, gid))
}
