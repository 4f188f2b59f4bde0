// Command-line interface of the monitor

use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;

/// FoundationDB Process Monitor
#[derive(Parser, Debug)]
#[command(name = "fdbmonitor")]
#[command(version, about = "FoundationDB Process Monitor")]
pub struct Options {
    /// The path of the configuration file describing the processes to
    /// supervise
    #[arg(
        long,
        value_name = "CONFFILE",
        default_value = "/etc/foundationdb/foundationdb.conf"
    )]
    pub conffile: PathBuf,

    /// The path of the mutual exclusion file for this instance of the
    /// monitor
    #[arg(long, value_name = "LOCKFILE", default_value = "/var/run/fdbmonitor.pid")]
    pub lockfile: PathBuf,

    /// Background the monitor process
    #[arg(long)]
    pub daemonize: bool,
}

impl Options {
    /// Parse the command line. Help exits 0; anything malformed prints the
    /// usage and exits 1.
    pub fn parse_or_exit() -> Self {
        match Self::try_parse() {
            Ok(options) => options,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                print!("{}", e);
                std::process::exit(0);
            }
            Err(e) => {
                print!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::try_parse_from(["fdbmonitor"]).unwrap();
        assert_eq!(
            options.conffile,
            PathBuf::from("/etc/foundationdb/foundationdb.conf")
        );
        assert_eq!(options.lockfile, PathBuf::from("/var/run/fdbmonitor.pid"));
        assert!(!options.daemonize);
    }

    #[test]
    fn test_overrides() {
        let options = Options::try_parse_from([
            "fdbmonitor",
            "--conffile",
            "/tmp/monitor.conf",
            "--lockfile",
            "/tmp/monitor.pid",
            "--daemonize",
        ])
        .unwrap();
        assert_eq!(options.conffile, PathBuf::from("/tmp/monitor.conf"));
        assert_eq!(options.lockfile, PathBuf::from("/tmp/monitor.pid"));
        assert!(options.daemonize);
    }

    #[test]
    fn test_unknown_flag_is_an_error() {
        assert!(Options::try_parse_from(["fdbmonitor", "--bogus"]).is_err());
    }
}
