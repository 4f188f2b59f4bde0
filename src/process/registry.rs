use crate::config::ProcessCommand;
use crate::process::pipes::OutputPipes;
use nix::unistd::Pid;
use std::collections::HashMap;

/// A registry entry: the declared command plus the output pipes that follow
/// it across restarts.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub command: ProcessCommand,
    pub pipes: OutputPipes,
}

/// The id ↔ command ↔ pid relation for the whole fleet.
///
/// The pid maps hold only ids, never command references, so replacing a
/// command during a reload cannot dangle. The two pid maps are kept as
/// mutual inverses restricted to live pids.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: HashMap<u64, SupervisedProcess>,
    id_pid: HashMap<u64, Pid>,
    pid_id: HashMap<Pid, u64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`. A replaced entry is dropped,
    /// which tears down its pipes and forwarding tasks.
    pub fn insert(&mut self, id: u64, entry: SupervisedProcess) {
        self.entries.insert(id, entry);
    }

    /// Remove the entry for `id` entirely. The caller must already have
    /// unbound any live pid.
    pub fn remove(&mut self, id: u64) -> Option<SupervisedProcess> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<&SupervisedProcess> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut SupervisedProcess> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Record a freshly launched pid for `id`.
    pub fn bind(&mut self, id: u64, pid: Pid) {
        self.id_pid.insert(id, pid);
        self.pid_id.insert(pid, id);
    }

    /// Remove the mapping for a pid that has been reaped. Returns the id it
    /// belonged to, if it was ours.
    pub fn unbind_pid(&mut self, pid: Pid) -> Option<u64> {
        let id = self.pid_id.remove(&pid)?;
        self.id_pid.remove(&id);
        Some(id)
    }

    /// Remove the mapping for `id`. Returns the pid it was bound to.
    pub fn unbind(&mut self, id: u64) -> Option<Pid> {
        let pid = self.id_pid.remove(&id)?;
        self.pid_id.remove(&pid);
        Some(pid)
    }

    pub fn pid_of(&self, id: u64) -> Option<Pid> {
        self.id_pid.get(&id).copied()
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.id_pid.contains_key(&id)
    }

    /// Ids with a live child, in ascending order for deterministic
    /// reconciliation.
    pub fn live_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.id_pid.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn live_count(&self) -> usize {
        self.id_pid.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn entry(qualified_section: &str, id: u64) -> SupervisedProcess {
        let conf = format!(
            "[{}.{}]\ncommand = /bin/true\nrestart_delay = 1\n",
            qualified_section, id
        );
        let store = ConfigStore::parse(&conf).unwrap();
        SupervisedProcess {
            command: ProcessCommand::new(&store, qualified_section, id),
            pipes: OutputPipes::new(&format!("{}.{}", qualified_section, id)).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_bind_and_unbind_are_inverses() {
        let mut registry = ProcessRegistry::new();
        registry.insert(1, entry("srv", 1));
        registry.insert(2, entry("srv", 2));

        registry.bind(1, Pid::from_raw(100));
        registry.bind(2, Pid::from_raw(200));

        assert_eq!(registry.pid_of(1), Some(Pid::from_raw(100)));
        assert_eq!(registry.live_ids(), vec![1, 2]);

        assert_eq!(registry.unbind_pid(Pid::from_raw(100)), Some(1));
        assert!(!registry.is_live(1));
        assert_eq!(registry.pid_of(1), None);

        assert_eq!(registry.unbind(2), Some(Pid::from_raw(200)));
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_unbind_unknown_pid() {
        let mut registry = ProcessRegistry::new();
        assert_eq!(registry.unbind_pid(Pid::from_raw(31337)), None);
    }

    #[tokio::test]
    async fn test_replacing_entry_keeps_pid_binding() {
        let mut registry = ProcessRegistry::new();
        registry.insert(7, entry("srv", 7));
        registry.bind(7, Pid::from_raw(700));

        // A reload that replaces the command must not disturb the live pid
        registry.insert(7, entry("srv", 7));
        assert_eq!(registry.pid_of(7), Some(Pid::from_raw(700)));
        assert!(registry.contains(7));
    }
}
