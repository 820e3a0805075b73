//! Path resolution against the sandbox and the root allow-list
//!
//! All checks are lexical and happen before any filesystem access: a `..`
//! that would climb out of the sandbox is rejected without ever touching
//! the disk.

use std::path::{Component, Path, PathBuf};

use crate::error::{AngelError, AngelResult};

/// Normalize a path lexically: resolve `.` and `..` without consulting the
/// filesystem. Returns `None` when `..` pops past the start of a relative
/// path.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // `/..` stays at the root; `..` past the start of a
                // relative path escapes.
                if !out.pop() && !path.is_absolute() {
                    return None;
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }
    Some(out)
}

/// Whether `path` equals `base` or sits below it (both already normalized)
pub fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}

/// Resolve a user-supplied path: absolute paths must lie inside one of the
/// roots or the sandbox; relative paths resolve inside the sandbox and may
/// not escape it.
pub fn resolve(raw: &str, sandbox: &Path, roots: &[PathBuf]) -> AngelResult<PathBuf> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        let normalized = normalize(candidate)
            .ok_or_else(|| AngelError::validation(format!("unresolvable path {raw:?}")))?;
        if is_within(&normalized, sandbox) || roots.iter().any(|r| is_within(&normalized, r)) {
            return Ok(normalized);
        }
        return Err(AngelError::permission(format!(
            "path {raw:?} is outside the configured roots"
        )));
    }

    let joined = sandbox.join(candidate);
    let normalized = normalize(&joined)
        .ok_or_else(|| AngelError::permission(format!("path {raw:?} escapes the sandbox")))?;
    if !is_within(&normalized, sandbox) {
        return Err(AngelError::permission(format!(
            "path {raw:?} escapes the sandbox"
        )));
    }
    Ok(normalized)
}

/// Validate a replacement root list: every path must exist, be a directory,
/// be absolute, and no root may be a prefix of another.
pub fn validate_roots(roots: &[PathBuf]) -> AngelResult<()> {
    for root in roots {
        if !root.is_absolute() {
            return Err(AngelError::validation(format!(
                "root {} is not absolute",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(AngelError::validation(format!(
                "root {} does not exist or is not a directory",
                root.display()
            )));
        }
    }
    for (i, a) in roots.iter().enumerate() {
        for b in roots.iter().skip(i + 1) {
            if is_within(a, b) || is_within(b, a) {
                return Err(AngelError::validation(format!(
                    "roots {} and {} overlap",
                    a.display(),
                    b.display()
                )));
            }
        }
    }
    Ok(())
}
