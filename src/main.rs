use jail_index::{
    config::{Config, ListenMode, ServeRoots},
    http_server::HttpServer,
    logging::LoggerManager,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger = Arc::new(LoggerManager::new(config.logging.clone(), hostname));
    logger.initialize()?;

    info!(
        "Starting jail-index v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    config.log_summary();

    // Roots are resolved once and never change afterwards
    let roots = Arc::new(ServeRoots::from_config(&config.paths)?);
    info!(
        "Proxy root {} -> jail root {}",
        roots.translator().proxy_root(),
        roots.translator().jail_root().display()
    );

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    if config.server.listen == ListenMode::Unix {
        shutdown_coordinator.set_unix_socket(PathBuf::from(&config.server.address));
    }

    let mut http_server = HttpServer::new(config.server.clone(), roots);
    http_server.set_logger_manager(Arc::clone(&logger));

    // Bind before spawning so a bad address fails startup
    let listener = http_server.bind().await?;

    let http_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());
    let http_task = tokio::spawn(async move {
        let result = http_server.serve(listener, http_shutdown).await;
        if let Err(e) = &result {
            error!("HTTP server failed: {}", e);
        }
        result
    });
    shutdown_coordinator.set_server_task(http_task).await;

    // Returns once a signal arrived and the server drained
    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("Shutdown coordinator failed: {}", e);
    }

    info!("jail-index shutdown complete");
    Ok(())
}
