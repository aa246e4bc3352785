//! Path Translator Module
//!
//! Maps proxy-visible request paths onto the jailed local filesystem and back.
//! All functions here are lexical: they never touch the filesystem and cannot fail.

use std::path::{Path, PathBuf};

/// Lexically clean a `/`-separated path.
///
/// Collapses duplicate separators, drops `.` segments and resolves `..` against the
/// preceding segment. For absolute paths `..` never climbs above `/`. An empty result
/// becomes `.` (relative) or `/` (absolute). Trailing separators are removed.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if let Some(last) = segments.last() {
                    if *last != ".." {
                        segments.pop();
                        continue;
                    }
                }
                // Leading `..` survives only on relative paths
                if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Strip `prefix` from `path` on a segment boundary.
///
/// `/files` is a prefix of `/files` and `/files/a` but not of `/filesx`.
/// Returns the remainder without its leading separator.
pub fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return path.strip_prefix('/');
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

/// Bidirectional mapping between the proxy root and the jail root
#[derive(Debug, Clone, PartialEq)]
pub struct PathTranslator {
    proxy_root: String,
    jail_root: String,
}

impl PathTranslator {
    /// Create a translator; both roots are normalized once here
    pub fn new(proxy_root: &str, jail_root: &Path) -> Self {
        Self {
            proxy_root: normalize_path(&format!("/{}", proxy_root)),
            jail_root: normalize_path(&jail_root.to_string_lossy()),
        }
    }

    pub fn proxy_root(&self) -> &str {
        &self.proxy_root
    }

    pub fn jail_root(&self) -> &Path {
        Path::new(&self.jail_root)
    }

    /// Whether a request path falls under the proxy root
    pub fn is_under_proxy_root(&self, proxy_path: &str) -> bool {
        strip_path_prefix(proxy_path, &self.proxy_root).is_some()
    }

    /// Path of `proxy_path` relative to the proxy root, always absolute and clamped.
    ///
    /// `..` segments cannot climb above `/`, so joining the result onto any root stays
    /// beneath that root.
    pub fn relative_path(&self, proxy_path: &str) -> String {
        let remainder = strip_path_prefix(proxy_path, &self.proxy_root).unwrap_or(proxy_path);
        normalize_path(&format!("/{}", remainder))
    }

    /// Translate a proxy-visible path into a local path beneath the jail root
    pub fn to_local(&self, proxy_path: &str) -> PathBuf {
        let relative = self.relative_path(proxy_path);
        PathBuf::from(normalize_path(&format!("{}{}", self.jail_root, relative)))
    }

    /// Translate a local path back into its proxy-visible form
    pub fn to_proxy(&self, local_path: &Path) -> String {
        let local = normalize_path(&local_path.to_string_lossy());
        let remainder = strip_path_prefix(&local, &self.jail_root).unwrap_or(&local);
        normalize_path(&format!("{}/{}", self.proxy_root, remainder))
    }
}
