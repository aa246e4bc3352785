//! Jail Index - directory index and file server for a jailed filesystem subtree
//!
//! Sits behind a reverse proxy and serves a local directory tree under a virtual web
//! root. Every path used to answer a request, including symlink targets, is kept inside
//! the jail root. Directories render as sortable HTML indexes; regular files are either
//! streamed or handed back to the proxy with `X-Accel-Redirect`.

pub mod config;
pub mod directory_lister;
pub mod dispatcher;
pub mod error;
pub mod file_delivery;
pub mod http_server;
pub mod jail_guard;
pub mod logging;
pub mod path_translator;
pub mod shutdown;
pub mod sort_policy;

pub use error::{ProxyError, Result};
