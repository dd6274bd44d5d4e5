//! Path Jail — pure functions that map a client-supplied virtual path to an
//! absolute host path, confined to a user's home subtree (spec §4.3).
//!
//! `canonicalize` never touches disk. `resolve` does, because it must
//! follow symlinks before deciding whether the result escapes the jail.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Normalizes a client-supplied virtual path into canonical `/`-rooted
/// POSIX form, per spec §4.3.
///
/// - Backslashes are treated as separators.
/// - A leading drive letter (`C:`) is stripped.
/// - Empty or `.` input becomes `/`.
/// - Repeated separators collapse.
/// - `.` segments are dropped; `..` segments pop the previous segment,
///   never rising above `/`.
pub fn canonicalize(virtual_path: &str) -> String {
    let mut s = virtual_path.replace('\\', "/");

    // Strip a leading drive-letter prefix like "C:" or "c:".
    if s.len() >= 2 {
        let mut chars = s.chars();
        let first = chars.next().unwrap();
        if first.is_ascii_alphabetic() && chars.next() == Some(':') {
            s = s[2..].to_string();
        }
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in s.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Resolves a client-supplied virtual path to an absolute host path inside
/// `home_absolute`, following symlinks, and rejects escapes with
/// [`CoreError::PathEscape`].
///
/// `home_absolute` itself must already be canonical (resolved once at
/// session start, see [`resolve_home`]).
pub fn resolve(virtual_path: &str, home_absolute: &Path) -> CoreResult<PathBuf> {
    let canonical = canonicalize(virtual_path);
    let relative = canonical.trim_start_matches('/');
    let joined = if relative.is_empty() {
        home_absolute.to_path_buf()
    } else {
        home_absolute.join(relative)
    };

    let resolved = resolve_existing_prefix(&joined)?;
    ensure_descendant(&resolved, home_absolute)?;
    Ok(resolved)
}

/// Resolves `virtual_path` to a host path without following a final-
/// component symlink, for `lstat` (spec §4.5: "lstat does not follow
/// symlinks"). The parent directory is still resolved through the jail —
/// symlinks earlier in the path are followed and jail-checked exactly as
/// in [`resolve`] — but the leaf component is appended unresolved, so a
/// symlink at the leaf is reported as itself, not as its target.
pub fn resolve_leaf_no_follow(virtual_path: &str, home_absolute: &Path) -> CoreResult<PathBuf> {
    let canonical = canonicalize(virtual_path);
    let relative = canonical.trim_start_matches('/');

    let (parent_rel, leaf) = match relative.rfind('/') {
        Some(idx) => (&relative[..idx], Some(&relative[idx + 1..])),
        None if relative.is_empty() => ("", None),
        None => ("", Some(relative)),
    };

    let parent_joined = if parent_rel.is_empty() {
        home_absolute.to_path_buf()
    } else {
        home_absolute.join(parent_rel)
    };
    let resolved_parent = resolve_existing_prefix(&parent_joined)?;
    ensure_descendant(&resolved_parent, home_absolute)?;

    match leaf {
        Some(name) => Ok(resolved_parent.join(name)),
        None => Ok(resolved_parent),
    }
}

/// Resolves the user's sanitized `home_dir` against the shared root at
/// session start, enforcing the same jail the root itself (spec §4.3,
/// "home resolution").
pub fn resolve_home(home_dir: &str, shared_root: &Path) -> CoreResult<PathBuf> {
    let sanitized = sanitize_home_dir(home_dir);
    let root = resolve_existing_prefix(shared_root)?;
    let joined = root.join(&sanitized);
    let resolved = resolve_existing_prefix(&joined)?;
    ensure_descendant(&resolved, &root)?;
    Ok(resolved)
}

/// Validates a stored `home_dir` invariant (spec §3): no empty segments,
/// no `.`/`..`, no drive prefix. Returns the sanitized relative path.
pub fn sanitize_home_dir(home_dir: &str) -> String {
    let canonical = canonicalize(home_dir);
    canonical.trim_start_matches('/').to_string()
}

/// Resolves symlinks in `path`'s *existing* prefix, treating any
/// not-yet-created trailing components as literal. This lets `open()`
/// with `O_CREAT` and `mkdir` jail-check a path that doesn't exist yet,
/// while still rejecting a symlink planted earlier in the path that
/// points outside the jail.
fn resolve_existing_prefix(path: &Path) -> CoreResult<PathBuf> {
    let mut existing = path;
    let mut trailing: Vec<std::ffi::OsString> = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut result = resolved;
                for component in trailing.iter().rev() {
                    result.push(component);
                }
                return Ok(result);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let Some(parent) = existing.parent() else {
                    return Err(CoreError::Io(e));
                };
                let Some(name) = existing.file_name() else {
                    return Err(CoreError::Io(e));
                };
                trailing.push(name.to_os_string());
                existing = parent;
            }
            Err(e) => return Err(CoreError::Io(e)),
        }
    }
}

fn ensure_descendant(candidate: &Path, home: &Path) -> CoreResult<()> {
    if candidate == home || candidate.starts_with(home) {
        Ok(())
    } else {
        Err(CoreError::PathEscape(candidate.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn canonicalize_table_s4() {
        assert_eq!(canonicalize(""), "/");
        assert_eq!(canonicalize("."), "/");
        assert_eq!(canonicalize("/a/./b"), "/a/b");
        assert_eq!(canonicalize("/a/b/../c"), "/a/c");
        assert_eq!(canonicalize("\\a\\b"), "/a/b");
        assert_eq!(canonicalize("C:\\a"), "/a");
        assert_eq!(canonicalize("/../.."), "/");
    }

    #[test]
    fn canonicalize_collapses_repeated_separators() {
        assert_eq!(canonicalize("/a//b///c"), "/a/b/c");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for input in ["", ".", "/a/./b", "/a/b/../c", "\\a\\b", "C:\\a", "/../.."] {
            let once = canonicalize(input);
            let twice = canonicalize(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn resolve_stays_inside_home() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join("hello.txt"), b"hi").unwrap();

        let resolved = resolve("/hello.txt", &home).unwrap();
        assert_eq!(resolved, home.join("hello.txt"));
    }

    #[test]
    fn resolve_rejects_dotdot_escape() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/passwd"), b"root:x").unwrap();

        let err = resolve("/../etc/passwd", &home).unwrap_err();
        assert!(matches!(err, CoreError::PathEscape(_)));
    }

    #[test]
    fn resolve_rejects_symlink_escape() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), b"nope").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&outside, home.join("escape")).unwrap();
            let err = resolve("/escape/secret.txt", &home).unwrap_err();
            assert!(matches!(err, CoreError::PathEscape(_)));
        }
    }

    #[test]
    fn resolve_allows_nonexistent_path_for_create() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();

        let resolved = resolve("/new/nested/file.txt", &home).unwrap();
        assert_eq!(resolved, home.join("new/nested/file.txt"));
    }

    #[test]
    fn resolve_leaf_no_follow_reports_symlink_itself() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join("real.txt"), b"hi").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(home.join("real.txt"), home.join("link.txt")).unwrap();
            let resolved = resolve_leaf_no_follow("/link.txt", &home).unwrap();
            assert_eq!(resolved, home.join("link.txt"));
            let meta = fs::symlink_metadata(&resolved).unwrap();
            assert!(meta.file_type().is_symlink());
        }
    }

    #[test]
    fn resolve_leaf_no_follow_rejects_parent_symlink_escape() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("alice");
        fs::create_dir_all(&home).unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), b"nope").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&outside, home.join("escape")).unwrap();
            let err = resolve_leaf_no_follow("/escape/secret.txt", &home).unwrap_err();
            assert!(matches!(err, CoreError::PathEscape(_)));
        }
    }

    #[test]
    fn resolve_home_requires_descendant_of_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("srv/sftp");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(root.join("alice")).unwrap();

        let home = resolve_home("alice", &root).unwrap();
        assert_eq!(home, root.join("alice"));
    }

    #[test]
    fn sanitize_home_dir_strips_traversal() {
        assert_eq!(sanitize_home_dir("../../etc"), "etc");
        assert_eq!(sanitize_home_dir("alice"), "alice");
        assert_eq!(sanitize_home_dir(""), "");
    }
}
