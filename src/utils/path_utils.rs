use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Expands `~` and `$VAR`/`${VAR}` in a `cd` target. An unset variable is an error.
pub fn expand_path(path_str: &str) -> Result<PathBuf, AppError> {
    shellexpand::full(path_str)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| AppError::InvalidPath(format!("{}: {}", path_str, e)))
}

/// Folds `.` and `..` lexically so a missing directory still gets a readable path.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
                // `/..` stays at `/`.
            }
            _ => components.push(component),
        }
    }
    components.iter().collect()
}

pub fn home_dir() -> Result<PathBuf, AppError> {
    let home = expand_path("~")?;
    if home.as_os_str() == "~" {
        return Err(AppError::InvalidPath("home directory is unknown".to_string()));
    }
    Ok(home)
}

/// Resolves a `cd` target against the session directory. No target means home.
pub fn resolve_directory(target: Option<&str>, cwd: &Path) -> Result<PathBuf, AppError> {
    let expanded = match target {
        None => home_dir()?,
        Some(raw) => expand_path(raw)?,
    };
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    let normalized = normalize_path(&joined);
    debug!(target = ?target, path = %normalized.display(), "Resolving directory");

    let canonical = dunce::canonicalize(&normalized).map_err(|e| {
        AppError::InvalidPath(format!("{}: {}", normalized.display(), e))
    })?;
    if !canonical.is_dir() {
        return Err(AppError::InvalidPath(format!(
            "{}: Not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}
