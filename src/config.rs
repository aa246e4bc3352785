//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Supports YAML configuration files. The serving roots are frozen into [`ServeRoots`] once at
//! startup and shared read-only with every request.

use crate::jail_guard::JailGuard;
use crate::path_translator::PathTranslator;
use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" | "" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// File the configuration was read from, if any
    #[serde(skip)]
    pub source_file: Option<String>,
}

/// Kind of socket the server listens on
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ListenMode {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "unix")]
    Unix,
}

impl Default for ListenMode {
    fn default() -> Self {
        ListenMode::Tcp
    }
}

impl std::str::FromStr for ListenMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ListenMode::Tcp),
            "unix" => Ok(ListenMode::Unix),
            other => Err(format!("Unknown listen type '{}', expected tcp or unix", other)),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenMode,
    /// `host:port` or `:port` for TCP, a socket path for Unix
    #[serde(default = "default_address")]
    pub address: String,
    /// Requests beyond this many in flight are answered with 503
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub shutdown_timeout: Duration,
}

fn default_address() -> String {
    ":8080".to_string()
}

fn default_max_concurrent_requests() -> usize {
    200
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenMode::default(),
            address: default_address(),
            max_concurrent_requests: default_max_concurrent_requests(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Socket address for TCP mode; a bare `:port` binds every interface
    pub fn tcp_socket_addr(&self) -> Result<SocketAddr> {
        let address = if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        };
        address.parse().map_err(|e| {
            ProxyError::ConfigError(format!("Invalid listen address '{}': {}", self.address, e))
        })
    }
}

/// Request and filesystem roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Path prefix of the requests this service answers
    #[serde(default = "default_proxy_root")]
    pub proxy_root: String,
    /// Local directory the proxy root maps to
    #[serde(
        default = "default_jail_root",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub jail_root: PathBuf,
    /// Root of X-Accel-Redirect paths; regular files are streamed directly when unset
    #[serde(default)]
    pub accel_redirect_root: Option<String>,
}

fn default_proxy_root() -> String {
    "/".to_string()
}

fn default_jail_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            proxy_root: default_proxy_root(),
            jail_root: default_jail_root(),
            accel_redirect_root: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily-rotated application logs; console only when unset
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_opt")]
    pub app_log_dir: Option<PathBuf>,
    #[serde(default = "default_access_log_enabled")]
    pub access_log_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_access_log_enabled() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
            access_log_enabled: default_access_log_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::load_from_matches(&matches)
    }

    /// Same as [`Self::load`] for an explicit argument list
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;
        Self::load_from_matches(&matches)
    }

    fn load_from_matches(matches: &clap::ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
            config.source_file = Some(config_path.clone());
        }

        // Override with environment variables
        config.apply_env_overrides();

        // Override with command line arguments
        config.apply_cli_overrides(matches)?;

        config.validate()?;

        Ok(config)
    }

    /// Log the effective configuration; call once logging is initialized
    pub fn log_summary(&self) {
        for line in self.summary_lines() {
            info!("{}", line);
        }
        debug!("Configuration: {:?}", self);
    }

    fn summary_lines(&self) -> Vec<String> {
        let accel = match &self.paths.accel_redirect_root {
            Some(root) => format!("X-Accel-Redirect enabled with root {}", root),
            None => "X-Accel-Redirect disabled, files are streamed directly".to_string(),
        };
        let source = match &self.source_file {
            Some(path) => format!("Configuration loaded from file: {}", path),
            None => "Configuration from defaults, environment and command line".to_string(),
        };
        vec![
            source,
            format!(
                "Serving {} from {} (listen: {:?} {})",
                self.paths.proxy_root,
                self.paths.jail_root.display(),
                self.server.listen,
                self.server.address
            ),
            accel,
        ]
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("jail-index")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Directory index and file server for a jailed filesystem subtree")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("listen")
                    .short('l')
                    .long("listen")
                    .value_name("TYPE")
                    .help("Type of socket to listen on: tcp (default) or unix"),
            )
            .arg(
                Arg::new("address")
                    .short('a')
                    .long("address")
                    .value_name("ADDR")
                    .help("Address to listen on: :8080 (default) or /path/to/unix/socket"),
            )
            .arg(
                Arg::new("proxy-root")
                    .short('p')
                    .long("proxy-root")
                    .value_name("PATH")
                    .help("Root of web requests to process (default: /)"),
            )
            .arg(
                Arg::new("jail-root")
                    .short('r')
                    .long("jail-root")
                    .value_name("DIR")
                    .help("Local filesystem path bound to the request root (default: .)"),
            )
            .arg(
                Arg::new("accel-redirect")
                    .long("xa")
                    .value_name("PATH")
                    .help("Root of X-Accel-Redirect paths to use"),
            )
            .arg(
                Arg::new("max-concurrent-requests")
                    .long("max-concurrent-requests")
                    .value_name("COUNT")
                    .help("Maximum number of concurrent requests (default: 200)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info, RUST_LOG overrides)"),
            )
            .arg(
                Arg::new("app-log-dir")
                    .long("app-log-dir")
                    .value_name("DIR")
                    .help("Directory for rotated application logs"),
            )
            .arg(
                Arg::new("no-access-log")
                    .long("no-access-log")
                    .action(clap::ArgAction::SetTrue)
                    .help("Disable per-request access logging"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("INDEX_LISTEN") {
            if let Ok(listen) = listen.parse() {
                self.server.listen = listen;
            }
        }

        if let Ok(address) = std::env::var("INDEX_ADDRESS") {
            self.server.address = address;
        }

        if let Ok(proxy_root) = std::env::var("INDEX_PROXY_ROOT") {
            self.paths.proxy_root = proxy_root;
        }

        if let Ok(jail_root) = std::env::var("INDEX_JAIL_ROOT") {
            self.paths.jail_root = pathbuf_serde::expand_tilde(&jail_root);
        }

        if let Ok(accel) = std::env::var("INDEX_ACCEL_REDIRECT") {
            self.paths.accel_redirect_root = Some(accel);
        }

        if let Ok(level) = std::env::var("INDEX_LOG_LEVEL") {
            self.logging.log_level = level;
        }
    }

    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(listen) = matches.get_one::<String>("listen") {
            self.server.listen = listen.parse().map_err(ProxyError::ConfigError)?;
        }

        if let Some(address) = matches.get_one::<String>("address") {
            self.server.address = address.clone();
        }

        if let Some(proxy_root) = matches.get_one::<String>("proxy-root") {
            self.paths.proxy_root = proxy_root.clone();
        }

        if let Some(jail_root) = matches.get_one::<String>("jail-root") {
            self.paths.jail_root = pathbuf_serde::expand_tilde(jail_root);
        }

        if let Some(accel) = matches.get_one::<String>("accel-redirect") {
            self.paths.accel_redirect_root = Some(accel.clone());
        }

        if let Some(max_requests) = matches.get_one::<String>("max-concurrent-requests") {
            self.server.max_concurrent_requests = max_requests.parse().map_err(|e| {
                ProxyError::ConfigError(format!(
                    "Invalid max-concurrent-requests '{}': {}",
                    max_requests, e
                ))
            })?;
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if let Some(dir) = matches.get_one::<String>("app-log-dir") {
            self.logging.app_log_dir = Some(pathbuf_serde::expand_tilde(dir));
        }

        if matches.get_flag("no-access-log") {
            self.logging.access_log_enabled = false;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.paths.proxy_root.starts_with('/') {
            return Err(ProxyError::ConfigError(format!(
                "Proxy root must start with '/', got '{}'",
                self.paths.proxy_root
            )));
        }

        if !self.paths.jail_root.is_dir() {
            return Err(ProxyError::ConfigError(format!(
                "Jail root '{}' does not exist or is not a directory",
                self.paths.jail_root.display()
            )));
        }

        if let Some(accel) = &self.paths.accel_redirect_root {
            if accel.is_empty() {
                return Err(ProxyError::ConfigError(
                    "X-Accel-Redirect root cannot be empty".to_string(),
                ));
            }
        }

        if self.server.max_concurrent_requests == 0 {
            return Err(ProxyError::ConfigError(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }

        match self.server.listen {
            ListenMode::Tcp => {
                self.server.tcp_socket_addr()?;
            }
            ListenMode::Unix => {
                if self.server.address.is_empty() {
                    return Err(ProxyError::ConfigError(
                        "Unix socket path cannot be empty".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Immutable roots shared by every request
#[derive(Debug, Clone)]
pub struct ServeRoots {
    translator: PathTranslator,
    guard: JailGuard,
    accel_redirect_root: Option<String>,
}

impl ServeRoots {
    /// Build roots from already absolute paths
    pub fn new(proxy_root: &str, jail_root: &Path, accel_redirect_root: Option<String>) -> Self {
        let translator = PathTranslator::new(proxy_root, jail_root);
        let guard = JailGuard::new(translator.jail_root());
        Self {
            translator,
            guard,
            accel_redirect_root: accel_redirect_root.filter(|root| !root.is_empty()),
        }
    }

    /// Build roots from configuration, resolving the jail root to an absolute path
    pub fn from_config(paths: &PathsConfig) -> Result<Self> {
        let jail_root = std::fs::canonicalize(&paths.jail_root).map_err(|e| {
            ProxyError::ConfigError(format!(
                "Cannot resolve jail root '{}': {}",
                paths.jail_root.display(),
                e
            ))
        })?;
        Ok(Self::new(
            &paths.proxy_root,
            &jail_root,
            paths.accel_redirect_root.clone(),
        ))
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn guard(&self) -> &JailGuard {
        &self.guard
    }

    pub fn accel_redirect_root(&self) -> Option<&str> {
        self.accel_redirect_root.as_deref()
    }
}
