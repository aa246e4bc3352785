//! Logging Module
//!
//! Sets up application logging with tracing and formats the per-request access log,
//! which is emitted as tracing events on the `access` target.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target of access log lines
pub const ACCESS_LOG_TARGET: &str = "access";

/// One served request
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub remote_addr: String,
    pub time: DateTime<Local>,
    pub method: String,
    pub request_uri: String,
    pub http_version: String,
    pub http_status: u16,
    pub bytes_sent: u64,
    pub total_time_ms: u64,
    pub user_agent: Option<String>,
}

impl AccessLogEntry {
    /// Common log format followed by the user agent and the duration in milliseconds
    pub fn format_line(&self) -> String {
        format!(
            "{} - - [{}] \"{} {} {}\" {} {} \"{}\" {}ms",
            self.remote_addr,
            self.time.format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.request_uri,
            self.http_version,
            self.http_status,
            self.bytes_sent,
            self.user_agent.as_deref().unwrap_or("-"),
            self.total_time_ms
        )
    }
}

/// Logger manager for handling all logging operations
#[derive(Debug, Clone)]
pub struct LoggerManager {
    pub config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Install the global tracing subscriber.
    ///
    /// A subscriber that is already installed (tests) is left in place.
    pub fn initialize(&self) -> Result<()> {
        let file_layer = match self.host_log_dir() {
            Some(host_log_dir) => {
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, host_log_dir, "jail-index.log");
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG overrides the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = self.host_log_dir() {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => debug!("Tracing subscriber already initialized, skipping"),
        }

        Ok(())
    }

    /// Per-host directory under the configured app log directory
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    pub fn access_log_enabled(&self) -> bool {
        self.config.access_log_enabled
    }

    /// Emit the access line for a finished request
    pub fn log_access(&self, entry: &AccessLogEntry) {
        if self.config.access_log_enabled {
            info!(target: ACCESS_LOG_TARGET, "{}", entry.format_line());
        }
    }
}
