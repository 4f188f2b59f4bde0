use fdbmonitor::cli::Options;
use fdbmonitor::daemon::{daemonize, Lockfile};
use fdbmonitor::error::MonitorError;
use fdbmonitor::supervisor::Supervisor;
use fdbmonitor::watcher::ConfigWatcher;
use fdbmonitor::{logging, paths};
use nix::unistd::chdir;
use std::process::exit;
use tracing::{error, info};

fn main() {
    let options = Options::parse_or_exit();

    // Anchor the configuration path before we chdir away
    let conf_path = match paths::absolute(&options.conffile) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("fdbmonitor: unable to resolve working directory: {}", e);
            exit(1);
        }
    };

    if options.daemonize {
        if let Err(e) = daemonize() {
            eprintln!("fdbmonitor: {}", e);
            exit(1);
        }
    }

    if let Err(e) = logging::init(options.daemonize) {
        eprintln!("fdbmonitor: {}", e);
        exit(1);
    }

    info!(
        "Started FoundationDB Process Monitor (v{})",
        env!("CARGO_PKG_VERSION")
    );

    if std::fs::metadata(&conf_path).is_err() {
        error!("No configuration file at {}", conf_path.display());
        exit(1);
    }

    let lockfile = match Lockfile::acquire(&options.lockfile) {
        Ok(lockfile) => lockfile,
        Err(MonitorError::LockfileBusy(path)) => {
            info!(
                "Lockfile {} is held by another process monitor, exiting",
                path.display()
            );
            exit(0);
        }
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    if let Err(e) = chdir("/") {
        error!("Unable to change working directory ({})", e);
        exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Unable to start runtime ({})", e);
            exit(1);
        }
    };

    let result = runtime.block_on(async {
        let mut watcher = ConfigWatcher::new(conf_path)?;
        let mut supervisor = Supervisor::new();
        supervisor.run(&mut watcher).await
    });

    match result {
        Ok(()) => {
            if let Err(e) = lockfile.remove() {
                error!("Unable to remove lockfile ({})", e);
            }
        }
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    }
}
