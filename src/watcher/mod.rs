// Configuration file watching that survives symlink retargeting

use crate::error::{MonitorError, Result};
use notify::event::{AccessKind, AccessMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Directory-change storms (editors, atomic replaces) are coalesced behind
/// a one-shot timer before the configuration is reloaded.
const COALESCE_WINDOW: Duration = Duration::from_millis(200);

const MAX_SYMLINK_DEPTH: usize = 100;

/// Raises a "configuration changed" event whenever the bytes reachable
/// through the configured path (following symlinks) may have changed.
///
/// Watches the canonical file, its parent directory (to catch atomic
/// replaces) and the containing directory of every symlink in the chain of
/// the configured path (to catch retargeting). After every relevant event
/// the path is re-resolved and all watches are re-armed against the new
/// canonical location.
pub struct ConfigWatcher {
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    /// The path as configured on the command line, absolute but with
    /// symlinks unresolved
    configured_path: PathBuf,
    canonical: PathBuf,
    /// Paths currently armed in the backend
    watched: Vec<PathBuf>,
    /// Event paths that warrant a reload: the canonical file plus every
    /// symlink in the chain
    interesting: HashSet<PathBuf>,
}

impl ConfigWatcher {
    /// Subscribe to changes of the configuration file at `configured_path`,
    /// which must be absolute.
    pub fn new(configured_path: PathBuf) -> Result<Self> {
        let canonical = std::fs::canonicalize(&configured_path).map_err(|e| {
            MonitorError::Watch(format!(
                "Unable to resolve configuration path {}: {}",
                configured_path.display(),
                e
            ))
        })?;

        let (tx, events) = mpsc::unbounded_channel();
        let watcher = recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })
        .map_err(|e| MonitorError::Watch(format!("Unable to initialize file watching: {}", e)))?;

        let mut this = Self {
            watcher,
            events,
            configured_path,
            canonical,
            watched: Vec::new(),
            interesting: HashSet::new(),
        };
        this.arm()?;
        Ok(this)
    }

    /// The canonical path of the configuration file as of the last re-arm.
    pub fn config_path(&self) -> &Path {
        &self.canonical
    }

    /// Wait until the configuration may have changed, re-arm the watches
    /// and return the (possibly new) canonical path.
    ///
    /// When the configured path cannot be re-resolved the event is logged
    /// and skipped, keeping the previous watch set so a later event can
    /// recover.
    pub async fn changed(&mut self) -> Result<PathBuf> {
        loop {
            let event = self
                .events
                .recv()
                .await
                .ok_or_else(|| MonitorError::Watch("event channel closed".to_string()))?;
            if !self.is_relevant(&event) {
                continue;
            }
            self.coalesce().await;

            match std::fs::canonicalize(&self.configured_path) {
                Err(e) => {
                    warn!(
                        "Unable to resolve configuration path {}, skipping reload ({})",
                        self.configured_path.display(),
                        e
                    );
                    continue;
                }
                Ok(canonical) => {
                    self.disarm();
                    self.canonical = canonical;
                    self.arm()?;
                    return Ok(self.canonical.clone());
                }
            }
        }
    }

    /// Absorb the rest of an event burst before acting on it.
    async fn coalesce(&mut self) {
        let deadline = tokio::time::sleep(COALESCE_WINDOW);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = self.events.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
        }
    }

    fn is_relevant(&self, result: &notify::Result<Event>) -> bool {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!("Configuration watch error: {}", e);
                return false;
            }
        };
        if !relevant_kind(&event.kind) {
            return false;
        }
        event.paths.iter().any(|path| self.interesting.contains(path))
    }

    fn arm(&mut self) -> Result<()> {
        let confdir = self
            .canonical
            .parent()
            .ok_or_else(|| {
                MonitorError::Watch(format!(
                    "Configuration file {} has no parent directory",
                    self.canonical.display()
                ))
            })?
            .to_path_buf();

        let links = symlink_chain(&self.configured_path)?;

        let mut interesting = HashSet::new();
        interesting.insert(self.canonical.clone());

        let mut targets = vec![self.canonical.clone(), confdir];
        for link in links {
            let parent = link
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            targets.push(parent);
            interesting.insert(link);
        }

        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.clone()) {
                continue;
            }
            self.watcher
                .watch(&target, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    MonitorError::Watch(format!("Unable to watch {}: {}", target.display(), e))
                })?;
            info!("Watching {}", target.display());
            self.watched.push(target);
        }

        self.interesting = interesting;
        Ok(())
    }

    fn disarm(&mut self) {
        for target in self.watched.drain(..) {
            if let Err(e) = self.watcher.unwatch(&target) {
                info!(
                    "Could not remove watch on {}, continuing ({})",
                    target.display(),
                    e
                );
            }
        }
    }
}

fn relevant_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Every symlink encountered while resolving `path`, walking each prefix of
/// the path and following link targets as the kernel would.
fn symlink_chain(path: &Path) -> Result<Vec<PathBuf>> {
    let mut links = Vec::new();
    let mut prefix = PathBuf::new();

    for component in path.components() {
        prefix.push(component);
        if matches!(component, Component::RootDir) {
            continue;
        }

        let mut subpath = prefix.clone();
        let mut depth = 0;
        loop {
            let meta = std::fs::symlink_metadata(&subpath).map_err(|e| {
                MonitorError::Watch(format!("Unable to stat {}: {}", subpath.display(), e))
            })?;
            if !meta.file_type().is_symlink() {
                break;
            }
            depth += 1;
            if depth > MAX_SYMLINK_DEPTH {
                return Err(MonitorError::Watch(format!(
                    "Too many nested symlinks in path {}",
                    path.display()
                )));
            }

            info!("Watching parent directory of symlink {}", subpath.display());
            links.push(subpath.clone());

            let target = std::fs::read_link(&subpath).map_err(|e| {
                MonitorError::Watch(format!("Unable to read symlink {}: {}", subpath.display(), e))
            })?;
            let parent = subpath
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            subpath = if target.is_absolute() {
                target
            } else {
                parent.join(target)
            };
        }
    }

    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn canonical_tempdir() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().canonicalize().unwrap();
        (dir, path)
    }

    #[test]
    fn test_symlink_chain_plain_file() {
        let (_dir, root) = canonical_tempdir();
        let file = root.join("monitor.conf");
        std::fs::write(&file, "[general]\n").unwrap();

        assert!(symlink_chain(&file).unwrap().is_empty());
    }

    #[test]
    fn test_symlink_chain_single_link() {
        let (_dir, root) = canonical_tempdir();
        let target = root.join("a.conf");
        std::fs::write(&target, "[general]\n").unwrap();
        let link = root.join("monitor.conf");
        symlink(&target, &link).unwrap();

        assert_eq!(symlink_chain(&link).unwrap(), vec![link]);
    }

    #[test]
    fn test_symlink_chain_nested_links() {
        let (_dir, root) = canonical_tempdir();
        let target = root.join("real.conf");
        std::fs::write(&target, "[general]\n").unwrap();
        let middle = root.join("middle.conf");
        symlink(&target, &middle).unwrap();
        let front = root.join("front.conf");
        symlink(&middle, &front).unwrap();

        assert_eq!(symlink_chain(&front).unwrap(), vec![front, middle]);
    }

    #[test]
    fn test_symlink_chain_relative_target() {
        let (_dir, root) = canonical_tempdir();
        let target = root.join("a.conf");
        std::fs::write(&target, "[general]\n").unwrap();
        let link = root.join("monitor.conf");
        symlink("a.conf", &link).unwrap();

        assert_eq!(symlink_chain(&link).unwrap(), vec![link]);
    }

    #[tokio::test]
    async fn test_file_modification_raises_change() {
        let (_dir, root) = canonical_tempdir();
        let file = root.join("monitor.conf");
        std::fs::write(&file, "[general]\n").unwrap();

        let mut watcher = ConfigWatcher::new(file.clone()).unwrap();
        std::fs::write(&file, "[general]\nrestart_delay = 10\n").unwrap();

        let changed = timeout(Duration::from_secs(10), watcher.changed())
            .await
            .expect("no change event within timeout")
            .unwrap();
        assert_eq!(changed, file);
    }

    #[tokio::test]
    async fn test_unrelated_file_does_not_raise_change() {
        let (_dir, root) = canonical_tempdir();
        let file = root.join("monitor.conf");
        std::fs::write(&file, "[general]\n").unwrap();

        let mut watcher = ConfigWatcher::new(file.clone()).unwrap();
        std::fs::write(root.join("other.txt"), "noise").unwrap();

        assert!(timeout(Duration::from_secs(1), watcher.changed())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_symlink_retarget_resolves_new_canonical_path() {
        let (_dir, root) = canonical_tempdir();
        let a = root.join("a.conf");
        let b = root.join("b.conf");
        std::fs::write(&a, "[general]\n").unwrap();
        std::fs::write(&b, "[general]\n").unwrap();

        let link = root.join("monitor.conf");
        symlink(&a, &link).unwrap();

        let mut watcher = ConfigWatcher::new(link.clone()).unwrap();
        assert_eq!(watcher.config_path(), a);

        // Atomically retarget the symlink, as a deployment tool would
        let staging = root.join("monitor.conf.new");
        symlink(&b, &staging).unwrap();
        std::fs::rename(&staging, &link).unwrap();

        let changed = timeout(Duration::from_secs(10), watcher.changed())
            .await
            .expect("no change event within timeout")
            .unwrap();
        assert_eq!(changed, b);
        assert_eq!(watcher.config_path(), b);
    }
}
