//! Proxy Dispatcher Module
//!
//! Classifies the target of a request path and decides how it is answered: a redirect
//! for symlinks, an index page for directories, or file delivery for regular files.
//! Everything here is synchronous filesystem work; callers run it on the blocking pool.

use crate::config::ServeRoots;
use crate::directory_lister::{encode_href, DirectoryLister};
use crate::sort_policy::{read_sort_marker, SortSpec};
use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// How a request is answered
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Path lies outside the proxy root
    NotHandled,
    /// Symlink inside the jail; redirect to the proxy path of its target
    Redirect(String),
    /// Rendered HTML index
    Listing(String),
    /// Regular file delivered by the fronting proxy
    AccelRedirect {
        accel_root: String,
        relative_path: String,
        local_path: PathBuf,
    },
    /// Regular file streamed by this service
    ServeFile(PathBuf),
}

/// Top-level request router over an immutable set of roots
#[derive(Debug, Clone)]
pub struct ProxyDispatcher {
    roots: Arc<ServeRoots>,
}

impl ProxyDispatcher {
    pub fn new(roots: Arc<ServeRoots>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &ServeRoots {
        &self.roots
    }

    /// Route a decoded request path.
    ///
    /// `sort_override` is the raw `sort` query parameter, if any.
    pub fn dispatch(&self, request_path: &str, sort_override: Option<&str>) -> Result<Dispatch> {
        let translator = self.roots.translator();
        if !translator.is_under_proxy_root(request_path) {
            debug!("{} is outside proxy root {}", request_path, translator.proxy_root());
            return Ok(Dispatch::NotHandled);
        }

        let guard = self.roots.guard();
        let local_path = translator.to_local(request_path);

        // The containing directory may be reached through a symlink; nothing below it
        // is inspected unless it resolves inside the jail
        if let Some(parent) = local_path.parent().filter(|p| guard.contains(p)) {
            guard.check_resolved(parent)?;
        }

        let link_metadata = std::fs::symlink_metadata(&local_path)
            .map_err(|e| ProxyError::NotFound(e.to_string()))?;

        if link_metadata.file_type().is_symlink() {
            let target = guard.read_link(&local_path)?;
            self.check_link_chain(&local_path, &target)?;
            let location = encode_href(&translator.to_proxy(&target));
            debug!("Symlink {:?} redirects to {}", local_path, location);
            return Ok(Dispatch::Redirect(location));
        }

        // Intermediate directories may themselves be symlinks
        let resolved = guard.check_resolved(&local_path)?;
        let metadata =
            std::fs::metadata(&resolved).map_err(|e| ProxyError::NotFound(e.to_string()))?;

        if metadata.is_file() {
            return Ok(match self.roots.accel_redirect_root() {
                Some(accel_root) => Dispatch::AccelRedirect {
                    accel_root: accel_root.to_string(),
                    relative_path: translator.relative_path(request_path),
                    local_path,
                },
                None => Dispatch::ServeFile(resolved),
            });
        }

        if metadata.is_dir() {
            let marker = read_sort_marker(&local_path);
            let requested = SortSpec::resolve(marker.as_deref(), sort_override);
            let html = DirectoryLister::new(&self.roots).render_listing(&local_path, requested)?;
            return Ok(Dispatch::Listing(html));
        }

        debug!("{:?} is neither a file nor a directory", local_path);
        Err(ProxyError::NotFound(format!(
            "{} is not a regular file or directory",
            request_path
        )))
    }

    /// Require the whole chain behind `link_path` to end inside the jail.
    ///
    /// A chain that cannot be resolved although its first target exists is a loop. A
    /// missing first target is a dangling link and is still redirected.
    fn check_link_chain(&self, link_path: &Path, target: &Path) -> Result<()> {
        if target == link_path {
            return Err(ProxyError::SymlinkLoop(link_path.display().to_string()));
        }
        match self.roots.guard().check_resolved(link_path) {
            Ok(_) => Ok(()),
            Err(ProxyError::NotFound(_)) if std::fs::symlink_metadata(target).is_ok() => {
                Err(ProxyError::SymlinkLoop(link_path.display().to_string()))
            }
            Err(ProxyError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dispatcher(jail: &Path, accel: Option<&str>) -> ProxyDispatcher {
        let jail = std::fs::canonicalize(jail).unwrap();
        ProxyDispatcher::new(Arc::new(ServeRoots::new(
            "/files",
            &jail,
            accel.map(str::to_string),
        )))
    }

    #[test]
    fn test_outside_proxy_root_is_not_handled() {
        let temp_dir = TempDir::new().unwrap();
        let d = dispatcher(temp_dir.path(), None);
        assert_eq!(d.dispatch("/other/a.txt", None).unwrap(), Dispatch::NotHandled);
        assert_eq!(d.dispatch("/filesx", None).unwrap(), Dispatch::NotHandled);
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let d = dispatcher(temp_dir.path(), None);
        let err = d.dispatch("/files/nope.txt", None).unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
        assert_eq!(err.status_code(), hyper::StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_regular_file_is_served_or_accelerated() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("pub")).unwrap();
        std::fs::write(temp_dir.path().join("pub/a.txt"), b"hello").unwrap();

        let d = dispatcher(temp_dir.path(), None);
        match d.dispatch("/files/pub/a.txt", None).unwrap() {
            Dispatch::ServeFile(path) => assert!(path.ends_with("pub/a.txt")),
            other => panic!("unexpected dispatch {:?}", other),
        }

        let d = dispatcher(temp_dir.path(), Some("/internal"));
        match d.dispatch("/files/pub/a.txt", None).unwrap() {
            Dispatch::AccelRedirect {
                accel_root,
                relative_path,
                ..
            } => {
                assert_eq!(accel_root, "/internal");
                assert_eq!(relative_path, "/pub/a.txt");
            }
            other => panic!("unexpected dispatch {:?}", other),
        }
    }

    #[test]
    fn test_directory_is_listed() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"x").unwrap();

        let d = dispatcher(temp_dir.path(), None);
        match d.dispatch("/files/", None).unwrap() {
            Dispatch::Listing(html) => assert!(html.contains(r#"<a href="/files/a.txt">a.txt</a>"#)),
            other => panic!("unexpected dispatch {:?}", other),
        }
    }

    #[test]
    fn test_parent_segments_cannot_leave_jail() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("passwd"), b"jailed").unwrap();

        let d = dispatcher(temp_dir.path(), None);
        match d.dispatch("/files/../../passwd", None).unwrap() {
            Dispatch::ServeFile(path) => assert!(path.starts_with(d.roots().guard().root())),
            other => panic!("unexpected dispatch {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_jail_redirects() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("sub")).unwrap();
        std::fs::create_dir(temp_dir.path().join("other")).unwrap();
        std::os::unix::fs::symlink("../other", temp_dir.path().join("sub/link")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        assert_eq!(
            d.dispatch("/files/sub/link", None).unwrap(),
            Dispatch::Redirect("/files/other".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_outside_jail_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/etc/passwd", temp_dir.path().join("escape")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        let err = d.dispatch("/files/escape", None).unwrap_err();
        assert!(matches!(err, ProxyError::BadJailEscape(_)));
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_intermediate_directory_is_rejected() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("door")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        assert!(matches!(
            d.dispatch("/files/door/secret.txt", None),
            Err(ProxyError::BadJailEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_socket_entry_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let _listener =
            std::os::unix::net::UnixListener::bind(temp_dir.path().join("sock")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        assert!(matches!(
            d.dispatch("/files/sock", None),
            Err(ProxyError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_reached_through_outside_directory_is_rejected() {
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink("private-name", outside.path().join("l")).unwrap();
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("door")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        let err = d.dispatch("/files/door/l", None).unwrap_err();
        assert!(matches!(err, ProxyError::BadJailEscape(_)), "{:?}", err);
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_chain_leaving_jail_is_rejected() {
        let outside = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("hop")).unwrap();
        std::os::unix::fs::symlink("hop", temp_dir.path().join("innocent")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        assert!(matches!(
            d.dispatch("/files/innocent", None),
            Err(ProxyError::BadJailEscape(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loops_are_client_errors() {
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("self", temp_dir.path().join("self")).unwrap();
        std::os::unix::fs::symlink("b", temp_dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", temp_dir.path().join("b")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        for path in ["/files/self", "/files/a", "/files/b"] {
            let err = d.dispatch(path, None).unwrap_err();
            assert!(matches!(err, ProxyError::SymlinkLoop(_)), "{}: {:?}", path, err);
            assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_still_redirects() {
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("later.txt", temp_dir.path().join("soon")).unwrap();

        let d = dispatcher(temp_dir.path(), None);
        assert_eq!(
            d.dispatch("/files/soon", None).unwrap(),
            Dispatch::Redirect("/files/later.txt".to_string())
        );
    }
}
