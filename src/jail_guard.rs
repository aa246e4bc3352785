//! Jail Guard Module
//!
//! Decides whether a path lies within the jail root. Containment is checked on
//! normalized path components, never on raw substrings, so `/home/ftpx` is not
//! considered inside a jail rooted at `/home/ftp`.

use crate::path_translator::normalize_path;
use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Containment checks against a fixed jail root
#[derive(Debug, Clone)]
pub struct JailGuard {
    /// Lexically normalized jail root
    root: PathBuf,
    /// Jail root with every symlink resolved, used for post-canonicalization checks
    canonical_root: PathBuf,
}

impl JailGuard {
    /// Create a guard for `jail_root`.
    ///
    /// The canonical form is resolved once here; if the root cannot be canonicalized the
    /// lexical form is used for both checks.
    pub fn new(jail_root: &Path) -> Self {
        let root = PathBuf::from(normalize_path(&jail_root.to_string_lossy()));
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|e| {
            debug!("Jail root {:?} not canonicalizable ({}), using lexical form", root, e);
            root.clone()
        });
        Self {
            root,
            canonical_root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True iff the normalized candidate is the jail root or one of its descendants
    pub fn contains(&self, candidate: &Path) -> bool {
        let normalized = PathBuf::from(normalize_path(&candidate.to_string_lossy()));
        normalized.starts_with(&self.root)
    }

    /// Resolve a symlink target read from `link_path`.
    ///
    /// Relative targets are joined onto the directory containing the link. The result
    /// must stay inside the jail, otherwise `BadJailEscape` is returned and the link
    /// must not be followed.
    pub fn resolve_link_target(&self, link_path: &Path, target: &Path) -> Result<PathBuf> {
        let joined = if target.is_absolute() {
            target.to_path_buf()
        } else {
            link_path
                .parent()
                .unwrap_or_else(|| Path::new("/"))
                .join(target)
        };
        let resolved = PathBuf::from(normalize_path(&joined.to_string_lossy()));

        if !self.contains(&resolved) {
            warn!(
                "Symlink {:?} -> {:?} resolves outside of jail {:?}",
                link_path, target, self.root
            );
            return Err(ProxyError::BadJailEscape(format!(
                "{} -> {}",
                link_path.display(),
                target.display()
            )));
        }

        Ok(resolved)
    }

    /// Read the link at `link_path` and resolve it with [`Self::resolve_link_target`]
    pub fn read_link(&self, link_path: &Path) -> Result<PathBuf> {
        let target = std::fs::read_link(link_path)
            .map_err(|e| ProxyError::SymlinkReadError(e.to_string()))?;
        self.resolve_link_target(link_path, &target)
    }

    /// Fully resolve `path` on disk and require the result to stay inside the jail.
    ///
    /// Catches escapes through symlinked intermediate directories which a lexical check
    /// cannot see. Errors from canonicalization itself (typically a missing path) are
    /// returned as `NotFound`.
    pub fn check_resolved(&self, path: &Path) -> Result<PathBuf> {
        let canonical =
            std::fs::canonicalize(path).map_err(|e| ProxyError::NotFound(e.to_string()))?;
        if canonical.starts_with(&self.canonical_root) {
            Ok(canonical)
        } else {
            warn!(
                "Path {:?} resolves to {:?}, outside of jail {:?}",
                path, canonical, self.canonical_root
            );
            Err(ProxyError::BadJailEscape(path.display().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_contains_root_and_descendants() {
        let guard = JailGuard::new(Path::new("/home/ftp"));
        assert!(guard.contains(Path::new("/home/ftp")));
        assert!(guard.contains(Path::new("/home/ftp/")));
        assert!(guard.contains(Path::new("/home/ftp/pub/file")));
        assert!(guard.contains(Path::new("/home/ftp/pub/../other")));
    }

    #[test]
    fn test_contains_rejects_lookalike_prefix() {
        let guard = JailGuard::new(Path::new("/home/ftp"));
        assert!(!guard.contains(Path::new("/home/ftpx")));
        assert!(!guard.contains(Path::new("/home/ftpx/file")));
        assert!(!guard.contains(Path::new("/home")));
    }

    #[test]
    fn test_contains_rejects_parent_traversal() {
        let guard = JailGuard::new(Path::new("/home/ftp"));
        assert!(!guard.contains(Path::new("/home/ftp/../secret")));
        assert!(!guard.contains(Path::new("/home/ftp/a/../../secret")));
    }

    #[test]
    fn test_resolve_relative_target() {
        let guard = JailGuard::new(Path::new("/jail"));
        let resolved = guard
            .resolve_link_target(Path::new("/jail/sub/link"), Path::new("../other"))
            .unwrap();
        assert_eq!(resolved, PathBuf::from("/jail/other"));
    }

    #[test]
    fn test_resolve_relative_target_escaping() {
        let guard = JailGuard::new(Path::new("/jail"));
        let err = guard
            .resolve_link_target(Path::new("/jail/sub/link"), Path::new("../../etc"))
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadJailEscape(_)));
    }

    #[test]
    fn test_resolve_absolute_target() {
        let guard = JailGuard::new(Path::new("/jail"));
        assert!(guard
            .resolve_link_target(Path::new("/jail/link"), Path::new("/jail/a/b"))
            .is_ok());
        assert!(matches!(
            guard.resolve_link_target(Path::new("/jail/link"), Path::new("/etc/passwd")),
            Err(ProxyError::BadJailEscape(_))
        ));
    }

    #[test]
    fn test_read_link_on_regular_file_is_symlink_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let guard = JailGuard::new(temp_dir.path());
        assert!(matches!(
            guard.read_link(&file),
            Err(ProxyError::SymlinkReadError(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_resolved_catches_symlinked_directory() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let jail = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), jail.path().join("escape")).unwrap();
        std::fs::write(jail.path().join("ok.txt"), b"ok").unwrap();

        let guard = JailGuard::new(jail.path());
        assert!(guard.check_resolved(&jail.path().join("ok.txt")).is_ok());
        assert!(matches!(
            guard.check_resolved(&jail.path().join("escape/secret.txt")),
            Err(ProxyError::BadJailEscape(_))
        ));
        assert!(matches!(
            guard.check_resolved(&jail.path().join("missing")),
            Err(ProxyError::NotFound(_))
        ));
    }
}
