// Diffing a freshly parsed configuration against the live registry

use crate::config::{parse_instance_section, ConfigStore, ProcessCommand};
use crate::process::ProcessRegistry;
use std::collections::HashSet;
use tracing::error;

/// What to do with one currently live instance.
#[derive(Debug)]
pub enum LiveAction {
    /// The instance's section is gone from the configuration.
    Deconfigure { id: u64, kill: bool },
    /// The argv changed, or kill-on-change was just switched on; the stored
    /// command is replaced and, if `restart` is set, the child is killed and
    /// immediately relaunched.
    Replace {
        id: u64,
        fresh: ProcessCommand,
        restart: bool,
    },
    /// Same argv: only the policy fields are copied over.
    Update { id: u64, fresh: ProcessCommand },
}

/// The ordered action streams produced by one reconciliation pass. Kills
/// always complete before launches.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Instances killed because the target uid/gid changed; their commands
    /// are destroyed and the new-section pass relaunches them.
    pub identity_kills: Vec<u64>,
    /// Per-live-instance actions.
    pub actions: Vec<LiveAction>,
    /// Instance sections with no live child, to be constructed and started.
    pub new_starts: Vec<(String, u64)>,
}

/// Diff `store` against the registry. Pure bookkeeping: nothing is killed
/// or launched here.
pub fn build_plan(
    store: &ConfigStore,
    registry: &ProcessRegistry,
    identity_changed: bool,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    // uid/gid can only change by restart, so a changed pair condemns every
    // live instance that allows kill-on-change.
    let mut identity_killed: HashSet<u64> = HashSet::new();
    if identity_changed {
        for id in registry.live_ids() {
            if let Some(entry) = registry.get(id) {
                if entry.command.kill_on_configuration_change {
                    identity_killed.insert(id);
                    plan.identity_kills.push(id);
                }
            }
        }
    }

    for id in registry.live_ids() {
        if identity_killed.contains(&id) {
            continue;
        }
        let Some(entry) = registry.get(id) else {
            continue;
        };
        let command = &entry.command;

        if store.section_size(&command.qualified).is_none() {
            plan.actions.push(LiveAction::Deconfigure {
                id,
                kill: command.kill_on_configuration_change,
            });
            continue;
        }

        let fresh = ProcessCommand::new(store, &command.section, id);
        // Turning kill_on_configuration_change on also forces a restart, so
        // pending configuration changes are picked up.
        if !command.argv_equal(&fresh)
            || (fresh.kill_on_configuration_change && !command.kill_on_configuration_change)
        {
            let restart = fresh.kill_on_configuration_change;
            plan.actions.push(LiveAction::Replace { id, fresh, restart });
        } else {
            plan.actions.push(LiveAction::Update { id, fresh });
        }
    }

    // Newly configured sections: anything matching NAME.ID without a live
    // child gets started. Identity-killed instances reappear here.
    for section in store.sections() {
        match parse_instance_section(section) {
            Some((name, id)) => {
                if !registry.is_live(id) || identity_killed.contains(&id) {
                    plan.new_starts.push((name.to_string(), id));
                }
            }
            None => {
                if section.contains('.') {
                    error!("Found bogus id in {}", section);
                }
            }
        }
    }

    plan
}
