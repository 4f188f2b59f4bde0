// Read-only view of the parsed INI configuration

mod command;

pub use command::{ProcessCommand, RESERVED_KEYS, SCRUBBED_ENV_VARS};

use crate::error::{MonitorError, Result};
use ini::Ini;
use std::path::Path;

/// Read-only keyed store over the parsed configuration file.
///
/// All precedence decisions (instance > program > general > monitor
/// defaults) go through [`ConfigStore::value_multi`], which searches the
/// given sections in order and returns the first hit.
pub struct ConfigStore {
    ini: Ini,
}

impl ConfigStore {
    /// Load and parse the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| MonitorError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self { ini })
    }

    /// Parse configuration from a string.
    pub fn parse(contents: &str) -> Result<Self> {
        let ini = Ini::load_from_str(contents).map_err(|e| MonitorError::Config(e.to_string()))?;
        Ok(Self { ini })
    }

    /// Number of keys in `section`, or `None` when the section is absent.
    pub fn section_size(&self, section: &str) -> Option<usize> {
        self.ini
            .section(Some(section))
            .map(|props| props.iter().count())
    }

    /// Names of all sections in the file.
    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.ini.iter().filter_map(|(name, _)| name)
    }

    /// All key names in `section`, deduplicated, in file order. Empty when
    /// the section is absent.
    pub fn keys(&self, section: &str) -> Vec<&str> {
        let mut keys = Vec::new();
        if let Some(props) = self.ini.section(Some(section)) {
            for (key, _) in props.iter() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Value of `key` in `section`, if both exist.
    pub fn value<'a>(&'a self, section: &str, key: &str) -> Option<&'a str> {
        self.ini.section(Some(section)).and_then(|props| props.get(key))
    }

    /// Search `sections` in order and return the first value found for
    /// `key`. This is the sole mechanism for the precedence rule
    /// (instance > program > general > monitor defaults).
    ///
    /// # Arguments
    /// * `key` - Key name to look up
    /// * `sections` - Section names in decreasing precedence order
    pub fn value_multi<'a>(&'a self, key: &str, sections: &[&str]) -> Option<&'a str> {
        sections.iter().find_map(|section| self.value(section, key))
    }
}

/// Split an instance section name of the form `NAME.ID` at the last dot.
///
/// Returns `None` unless the suffix is a fully-numeric decimal id greater
/// than zero.
pub fn parse_instance_section(name: &str) -> Option<(&str, u64)> {
    let dot = name.rfind('.')?;
    let id = name[dot + 1..].parse::<u64>().ok().filter(|id| *id > 0)?;
    Some((&name[..dot], id))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
[fdbmonitor]
user = foundationdb

[general]
restart_delay = 60
cluster_file = /etc/foundationdb/fdb.cluster

[fdbserver]
command = /usr/sbin/fdbserver
listen_address = public

[fdbserver.4000]
listen_address = 127.0.0.1:4000
";

    #[test]
    fn test_section_size() {
        let store = ConfigStore::parse(SAMPLE).unwrap();
        assert_eq!(store.section_size("fdbserver"), Some(2));
        assert_eq!(store.section_size("fdbserver.4000"), Some(1));
        assert_eq!(store.section_size("fdbserver.4001"), None);
    }

    #[test]
    fn test_sections() {
        let store = ConfigStore::parse(SAMPLE).unwrap();
        let sections: Vec<&str> = store.sections().collect();
        assert!(sections.contains(&"fdbmonitor"));
        assert!(sections.contains(&"general"));
        assert!(sections.contains(&"fdbserver"));
        assert!(sections.contains(&"fdbserver.4000"));
    }

    #[test]
    fn test_value_multi_precedence() {
        let store = ConfigStore::parse(SAMPLE).unwrap();

        // Instance section wins over the program section
        assert_eq!(
            store.value_multi("listen_address", &["fdbserver.4000", "fdbserver", "general"]),
            Some("127.0.0.1:4000")
        );
        // Falls back to the program section, then general
        assert_eq!(
            store.value_multi("command", &["fdbserver.4000", "fdbserver", "general"]),
            Some("/usr/sbin/fdbserver")
        );
        assert_eq!(
            store.value_multi("restart_delay", &["fdbserver.4000", "fdbserver", "general"]),
            Some("60")
        );
        assert_eq!(
            store.value_multi("nonexistent", &["fdbserver.4000", "fdbserver", "general"]),
            None
        );
    }

    #[test]
    fn test_keys() {
        let store = ConfigStore::parse(SAMPLE).unwrap();
        let keys = store.keys("fdbserver");
        assert_eq!(keys, vec!["command", "listen_address"]);
        assert!(store.keys("missing").is_empty());
    }

    #[test]
    fn test_parse_instance_section() {
        assert_eq!(parse_instance_section("fdbserver.4000"), Some(("fdbserver", 4000)));
        assert_eq!(parse_instance_section("backup.agent.1"), Some(("backup.agent", 1)));
        assert_eq!(parse_instance_section("fdbserver"), None);
        assert_eq!(parse_instance_section("fdbserver.0"), None);
        assert_eq!(parse_instance_section("fdbserver.x40"), None);
        assert_eq!(parse_instance_section("fdbserver."), None);
        assert_eq!(parse_instance_section("fdbserver.-4"), None);
    }
}
