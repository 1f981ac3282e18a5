//! Resolution of task-supplied names inside the data directory.

use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

/// Normalize a path lexically (resolve `.` and `..` without touching the
/// filesystem).
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve `name` relative to `data_dir`.
///
/// Absolute names and names that climb out of the directory (lexically or
/// through a symlink) are rejected.
pub fn resolve_data_path(data_dir: &Path, name: &str) -> Result<PathBuf, SandboxError> {
    let rejected = || SandboxError::PathRejected {
        path: name.to_string(),
    };

    let relative = Path::new(name);
    if name.trim().is_empty() || relative.has_root() || relative.is_absolute() {
        return Err(rejected());
    }

    let base = data_dir
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(data_dir));
    let resolved = normalize_lexical(&base.join(relative));
    if resolved == base || !resolved.starts_with(&base) {
        return Err(rejected());
    }

    // Existing targets are re-checked after following symlinks.
    match resolved.canonicalize() {
        Ok(real) if !real.starts_with(&base) => Err(rejected()),
        Ok(real) => Ok(real),
        Err(_) => Ok(resolved),
    }
}
