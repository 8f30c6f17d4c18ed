//! Path handling between the sync root and the wire
//!
//! Outbound: absolute watcher/scan paths are stripped down to root-relative
//! '/'-separated wire paths. Inbound: wire paths are validated against
//! escaping the receiver's root before they touch the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::SyncError;

/// Strip the sync root prefix, yielding the wire form of a path.
///
/// # Errors
/// `Validation` if the path is outside the root, equals the root, or
/// contains non-UTF-8 components.
pub fn strip_base(root: &Path, path: &Path) -> Result<String, SyncError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        SyncError::Validation(format!("{} is outside the sync root", path.display()))
    })?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    SyncError::Validation(format!("{} is not valid UTF-8", path.display()))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(SyncError::Validation(format!(
                    "{} does not normalize under the sync root",
                    path.display()
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(SyncError::Validation(format!(
            "{} is the sync root itself",
            path.display()
        )));
    }

    Ok(parts.join("/"))
}

/// Validate a wire path and resolve it under `root`.
///
/// Rejects empty paths, absolute paths, parent traversal, Windows drive
/// prefixes, and UNC prefixes.
///
/// # Errors
/// `Validation` on any rejected form.
pub fn resolve(root: &Path, path: &str) -> Result<PathBuf, SyncError> {
    validate_wire_path(path)?;
    Ok(root.join(path))
}

/// Check a wire path for forms that could escape the receiver's root.
///
/// # Errors
/// `Validation` on any rejected form.
pub fn validate_wire_path(path: &str) -> Result<(), SyncError> {
    if path.is_empty() {
        return Err(SyncError::Validation("empty path".into()));
    }

    if path.starts_with('/') {
        return Err(SyncError::Validation(format!(
            "absolute path not allowed: {path}"
        )));
    }

    if path.split('/').any(|segment| segment == "..") {
        return Err(SyncError::Validation(format!(
            "parent traversal not allowed: {path}"
        )));
    }

    if path.len() >= 2 && path.as_bytes()[1] == b':' {
        return Err(SyncError::Validation(format!(
            "drive prefix not allowed: {path}"
        )));
    }

    if path.starts_with("\\\\") {
        return Err(SyncError::Validation(format!(
            "UNC path not allowed: {path}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_base_yields_relative_wire_path() {
        let root = Path::new("/srv/data");
        let stripped = strip_base(root, Path::new("/srv/data/sub/file.txt")).unwrap();
        assert_eq!(stripped, "sub/file.txt");
        assert!(!stripped.starts_with('/'));
        assert!(!stripped.split('/').any(|s| s == ".."));
    }

    #[test]
    fn strip_base_rejects_outside_root() {
        let root = Path::new("/srv/data");
        assert!(strip_base(root, Path::new("/etc/passwd")).is_err());
        assert!(strip_base(root, Path::new("/srv/data/../other")).is_err());
    }

    #[test]
    fn strip_base_rejects_root_itself() {
        let root = Path::new("/srv/data");
        assert!(strip_base(root, Path::new("/srv/data")).is_err());
    }

    #[test]
    fn validate_rejects_empty() {
        assert!(validate_wire_path("").is_err());
    }

    #[test]
    fn validate_rejects_absolute() {
        assert!(validate_wire_path("/etc/passwd").is_err());
    }

    #[test]
    fn validate_rejects_parent_traversal() {
        assert!(validate_wire_path("../secret").is_err());
        assert!(validate_wire_path("a/../../etc").is_err());
    }

    #[test]
    fn validate_rejects_drive_and_unc() {
        assert!(validate_wire_path("C:\\Windows").is_err());
        assert!(validate_wire_path("\\\\server\\share").is_err());
    }

    #[test]
    fn validate_allows_normal_paths() {
        assert!(validate_wire_path("file.txt").is_ok());
        assert!(validate_wire_path("a/b/c.bin").is_ok());
        assert!(validate_wire_path(".hidden").is_ok());
    }

    #[test]
    fn resolve_joins_under_root() {
        let resolved = resolve(Path::new("/srv/data"), "a/b.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/data/a/b.txt"));
    }
}
