// Path resolution helpers shared by the lockfile and the config watcher

use std::io;
use std::path::{Path, PathBuf};

/// Make a path absolute against the current working directory without
/// touching the filesystem. Symlinks are not resolved.
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Resolve a path to an absolute, symlink-free form.
///
/// Unlike `fs::canonicalize`, the final component is allowed to not exist
/// yet: the parent directory is canonicalized and the missing file name is
/// appended. This is what the lockfile needs on first start.
pub fn abspath(path: &Path) -> io::Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let name = path
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "path has no file name"))?;
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            Ok(abspath(parent)?.join(name))
        }
        Err(err) => Err(err),
    }
}
