use crate::config::ConfigStore;
use crate::process::backoff::RestartBackoff;
use tracing::error;

/// Keys that configure the monitor itself and are never emitted as child
/// command-line flags.
pub const RESERVED_KEYS: [&str; 8] = [
    "command",
    "restart_delay",
    "initial_restart_delay",
    "restart_backoff",
    "restart_delay_reset_interval",
    "disable_lifecycle_logging",
    "delete_wd40_env",
    "kill_on_configuration_change",
];

/// Environment variables removed from the child when `delete_wd40_env` is
/// set.
pub const SCRUBBED_ENV_VARS: [&str; 3] = ["WD40_BV", "WD40_IS_MY_DADDY", "CONF_BUILD_VERSION"];

/// Immutable description of one declared child process, built from the
/// configuration by the reconciler.
///
/// Construction failures (missing `command`, unparseable numeric fields,
/// backoff below 1.0) are logged and leave `argv` unset; such a command is
/// kept for registry bookkeeping but is never launched.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    /// Program-class section name, e.g. `fdbserver`
    pub section: String,
    /// Fully qualified instance section, e.g. `fdbserver.4000`
    pub qualified: String,
    /// Executable path followed by arguments; `None` when construction
    /// failed
    pub argv: Option<Vec<String>>,
    /// Restart-delay state machine for this instance
    pub backoff: RestartBackoff,
    /// Suppress per-launch lifecycle log lines
    pub quiet: bool,
    /// Scrub the fixed environment variable set from the child
    pub delete_wd40_env: bool,
    /// Set when the instance has disappeared from the configuration but its
    /// child is still alive
    pub deconfigured: bool,
    /// Whether a configuration edit that changes this instance forces an
    /// immediate restart
    pub kill_on_configuration_change: bool,
}

impl ProcessCommand {
    /// Build the command for instance `id` of `section` from the store.
    pub fn new(store: &ConfigStore, section: &str, id: u64) -> Self {
        let qualified = format!("{}.{}", section, id);
        let mut cmd = Self {
            section: section.to_string(),
            qualified,
            argv: None,
            backoff: RestartBackoff::unset(),
            quiet: false,
            delete_wd40_env: false,
            deconfigured: false,
            kill_on_configuration_change: true,
        };
        if let Err(msg) = cmd.configure(store, id) {
            error!("{}", msg);
        }
        cmd
    }

    fn configure(&mut self, store: &ConfigStore, id: u64) -> Result<(), String> {
        let qualified = self.qualified.clone();
        let q = qualified.as_str();
        let s = self.section.as_str();
        // Numeric policy fields fall back to the monitor defaults; the
        // command and the boolean toggles do not.
        let policy_sections = [q, s, "general", "fdbmonitor"];
        let local_sections = [q, s, "general"];

        let max_delay: u32 = store
            .value_multi("restart_delay", &policy_sections)
            .ok_or_else(|| format!("Unable to resolve restart delay for {}", q))?
            .parse()
            .map_err(|_| format!("Unable to parse restart delay for {}", q))?;

        let initial_delay = match store.value_multi("initial_restart_delay", &policy_sections) {
            None => 0,
            Some(raw) => raw
                .parse::<u32>()
                .map(|v| v.min(max_delay))
                .map_err(|_| format!("Unable to parse initial restart delay for {}", q))?,
        };

        let backoff = match store.value_multi("restart_backoff", &policy_sections) {
            None => f64::from(max_delay),
            Some(raw) => {
                let value: f64 = raw
                    .parse()
                    .map_err(|_| format!("Unable to parse restart backoff for {}", q))?;
                if value < 1.0 {
                    return Err(format!("Invalid restart backoff value {} for {}", value, q));
                }
                value
            }
        };

        let reset_interval = match store.value_multi("restart_delay_reset_interval", &policy_sections)
        {
            None => max_delay,
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| format!("Unable to parse restart delay reset interval for {}", q))?,
        };

        self.quiet = store.value_multi("disable_lifecycle_logging", &local_sections) == Some("true");
        self.delete_wd40_env = store.value_multi("delete_wd40_env", &local_sections) == Some("true");
        // Defaults to true; only an explicit value other than "true" turns
        // it off.
        if let Some(raw) = store.value_multi("kill_on_configuration_change", &local_sections) {
            if raw != "true" {
                self.kill_on_configuration_change = false;
            }
        }

        let binary = store
            .value_multi("command", &local_sections)
            .ok_or_else(|| format!("Unable to resolve command for {}", q))?;
        let mut argv: Vec<String> = binary.split_whitespace().map(str::to_string).collect();

        // Every other visible key becomes a --key=value flag. The key set is
        // the union of the three sections, sorted so argv comparison is
        // stable across reloads regardless of file order.
        let id_str = id.to_string();
        let mut keys: Vec<&str> = store.keys(s);
        for key in store.keys(q).into_iter().chain(store.keys("general")) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys.sort_unstable();

        for key in keys {
            if RESERVED_KEYS.contains(&key) {
                continue;
            }
            let value = store
                .value_multi(key, &local_sections)
                .unwrap_or_default()
                .replace("$ID", &id_str);
            argv.push(format!("--{}={}", key, value));
        }

        self.argv = Some(argv);
        self.backoff = RestartBackoff::new(initial_delay, max_delay, backoff, reset_interval);
        Ok(())
    }

    /// Adopt the policy fields of a freshly constructed command without
    /// touching argv or the in-flight restart delay (beyond clamping it to
    /// the new bounds).
    pub fn update(&mut self, other: &ProcessCommand) {
        self.quiet = other.quiet;
        self.delete_wd40_env = other.delete_wd40_env;
        self.deconfigured = other.deconfigured;
        self.kill_on_configuration_change = other.kill_on_configuration_change;
        self.backoff.update_policy(&other.backoff);
    }

    /// Whether both commands would launch the same argv, element for
    /// element. Degraded commands (no argv) compare equal to each other.
    pub fn argv_equal(&self, other: &ProcessCommand) -> bool {
        self.argv == other.argv
    }

    /// The executable path, when the command is launchable.
    pub fn executable(&self) -> Option<&str> {
        self.argv.as_deref().and_then(|argv| argv.first()).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(contents: &str) -> ConfigStore {
        ConfigStore::parse(contents).unwrap()
    }

    #[test]
    fn test_basic_argv_assembly() {
        let store = store(
            "[general]\n\
             restart_delay = 60\n\
             [fdbserver]\n\
             command = /usr/sbin/fdbserver\n\
             cluster_file = /etc/foundationdb/fdb.cluster\n\
             [fdbserver.4000]\n\
             public_address = auto:$ID\n",
        );
        let cmd = ProcessCommand::new(&store, "fdbserver", 4000);

        assert_eq!(cmd.qualified, "fdbserver.4000");
        assert_eq!(
            cmd.argv.as_deref(),
            Some(
                &[
                    "/usr/sbin/fdbserver".to_string(),
                    "--cluster_file=/etc/foundationdb/fdb.cluster".to_string(),
                    "--public_address=auto:4000".to_string(),
                ][..]
            )
        );
        assert_eq!(cmd.backoff.max_delay(), 60);
        assert_eq!(cmd.backoff.initial_delay(), 0);
        assert!(cmd.kill_on_configuration_change);
        assert!(!cmd.quiet);
        assert!(!cmd.delete_wd40_env);
    }

    #[test]
    fn test_command_value_is_whitespace_split() {
        let store = store(
            "[general]\n\
             restart_delay = 10\n\
             [worker.1]\n\
             command = /bin/sh -c exit\n",
        );
        let cmd = ProcessCommand::new(&store, "worker", 1);
        assert_eq!(
            cmd.argv.as_deref(),
            Some(&["/bin/sh".to_string(), "-c".to_string(), "exit".to_string()][..])
        );
    }

    #[test]
    fn test_instance_value_overrides_program_value() {
        let store = store(
            "[general]\n\
             restart_delay = 10\n\
             [fdbserver]\n\
             command = /usr/sbin/fdbserver\n\
             listen_address = public\n\
             [fdbserver.7]\n\
             listen_address = 127.0.0.1:7\n",
        );
        let cmd = ProcessCommand::new(&store, "fdbserver", 7);
        let argv = cmd.argv.unwrap();
        assert!(argv.contains(&"--listen_address=127.0.0.1:7".to_string()));
        assert!(!argv.iter().any(|a| a.contains("public")));
    }

    #[test]
    fn test_argv_is_independent_of_key_order() {
        let a = store(
            "[general]\nrestart_delay = 10\n\
             [srv]\ncommand = /bin/true\nalpha = 1\nbeta = 2\n\
             [srv.1]\ngamma = 3\n",
        );
        let b = store(
            "[srv.1]\ngamma = 3\n\
             [srv]\nbeta = 2\nalpha = 1\ncommand = /bin/true\n\
             [general]\nrestart_delay = 10\n",
        );
        let cmd_a = ProcessCommand::new(&a, "srv", 1);
        let cmd_b = ProcessCommand::new(&b, "srv", 1);
        assert!(cmd_a.argv_equal(&cmd_b));
        assert_eq!(
            cmd_a.argv.as_deref(),
            Some(
                &[
                    "/bin/true".to_string(),
                    "--alpha=1".to_string(),
                    "--beta=2".to_string(),
                    "--gamma=3".to_string(),
                ][..]
            )
        );
    }

    #[test]
    fn test_reserved_keys_are_not_flags() {
        let store = store(
            "[general]\n\
             restart_delay = 10\n\
             [srv.1]\n\
             command = /bin/true\n\
             initial_restart_delay = 1\n\
             restart_backoff = 2.0\n\
             restart_delay_reset_interval = 60\n\
             disable_lifecycle_logging = true\n\
             delete_wd40_env = true\n\
             kill_on_configuration_change = false\n",
        );
        let cmd = ProcessCommand::new(&store, "srv", 1);
        assert_eq!(cmd.argv.as_deref(), Some(&["/bin/true".to_string()][..]));
        assert!(cmd.quiet);
        assert!(cmd.delete_wd40_env);
        assert!(!cmd.kill_on_configuration_change);
    }

    #[test]
    fn test_id_substitution_is_global() {
        let store = store(
            "[general]\nrestart_delay = 10\n\
             [srv.42]\ncommand = /bin/true\ndatadir = /var/$ID/data-$ID\n",
        );
        let cmd = ProcessCommand::new(&store, "srv", 42);
        assert!(cmd
            .argv
            .unwrap()
            .contains(&"--datadir=/var/42/data-42".to_string()));
    }

    #[test]
    fn test_missing_restart_delay_degrades() {
        let store = store("[srv.1]\ncommand = /bin/true\n");
        let cmd = ProcessCommand::new(&store, "srv", 1);
        assert!(cmd.argv.is_none());
    }

    #[test]
    fn test_unparseable_numeric_field_degrades() {
        let store = store("[srv.1]\ncommand = /bin/true\nrestart_delay = sixty\n");
        let cmd = ProcessCommand::new(&store, "srv", 1);
        assert!(cmd.argv.is_none());
    }

    #[test]
    fn test_backoff_below_one_degrades() {
        let store = store(
            "[srv.1]\ncommand = /bin/true\nrestart_delay = 60\nrestart_backoff = 0.5\n",
        );
        let cmd = ProcessCommand::new(&store, "srv", 1);
        assert!(cmd.argv.is_none());
    }

    #[test]
    fn test_missing_command_degrades() {
        let store = store("[srv.1]\nrestart_delay = 60\n");
        let cmd = ProcessCommand::new(&store, "srv", 1);
        assert!(cmd.argv.is_none());
    }

    #[test]
    fn test_initial_delay_clamped_to_max() {
        let store = store(
            "[srv.1]\ncommand = /bin/true\nrestart_delay = 10\ninitial_restart_delay = 50\n",
        );
        let cmd = ProcessCommand::new(&store, "srv", 1);
        assert_eq!(cmd.backoff.initial_delay(), 10);
        assert_eq!(cmd.backoff.max_delay(), 10);
    }

    #[test]
    fn test_kill_on_configuration_change_parse() {
        // Absent: defaults to true
        let absent = store("[srv.1]\ncommand = /bin/true\nrestart_delay = 1\n");
        assert!(ProcessCommand::new(&absent, "srv", 1).kill_on_configuration_change);

        // Present and "true": stays true
        let explicit = store(
            "[srv.1]\ncommand = /bin/true\nrestart_delay = 1\nkill_on_configuration_change = true\n",
        );
        assert!(ProcessCommand::new(&explicit, "srv", 1).kill_on_configuration_change);

        // Present and anything else: false
        let other = store(
            "[srv.1]\ncommand = /bin/true\nrestart_delay = 1\nkill_on_configuration_change = yes\n",
        );
        assert!(!ProcessCommand::new(&other, "srv", 1).kill_on_configuration_change);
    }

    #[test]
    fn test_update_copies_policy_but_not_argv() {
        let old_store = store(
            "[srv.1]\ncommand = /bin/old\nrestart_delay = 60\ndisable_lifecycle_logging = false\n",
        );
        let new_store = store(
            "[srv.1]\ncommand = /bin/new\nrestart_delay = 30\ndisable_lifecycle_logging = true\n",
        );
        let mut cmd = ProcessCommand::new(&old_store, "srv", 1);
        let fresh = ProcessCommand::new(&new_store, "srv", 1);

        cmd.update(&fresh);
        assert_eq!(cmd.executable(), Some("/bin/old"));
        assert!(cmd.quiet);
        assert_eq!(cmd.backoff.max_delay(), 30);
    }
}
