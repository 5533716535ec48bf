//! Path confinement for plugin-originated filesystem access

use crate::{PluginError, PluginResult};
use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
/// Returns `None` when `..` would climb above the start of the path.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }

    Some(out)
}

/// Resolve `candidate` (relative to `root`, or absolute) and require that it
/// stays inside `root`, both lexically and after following symlinks of the
/// deepest ancestor that already exists. `root` must exist.
pub fn confine(root: &Path, candidate: &Path) -> PluginResult<PathBuf> {
    let violation = || PluginError::PathViolation(candidate.display().to_string());

    let canonical_root = root.canonicalize()?;
    let lexical_root = normalize(root).ok_or_else(violation)?;

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        canonical_root.join(candidate)
    };
    let resolved = normalize(&joined).ok_or_else(violation)?;

    // Re-anchor paths spelled through a non-canonical root
    let resolved = match resolved.strip_prefix(&lexical_root) {
        Ok(rest) if candidate.is_absolute() => canonical_root.join(rest),
        _ => resolved,
    };
    if !resolved.starts_with(&canonical_root) {
        return Err(violation());
    }

    let mut existing = resolved.as_path();
    while !existing.exists() {
        existing = existing.parent().ok_or_else(violation)?;
    }
    if !existing.canonicalize()?.starts_with(&canonical_root) {
        return Err(violation());
    }

    Ok(resolved)
}
