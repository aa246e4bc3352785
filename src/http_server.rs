//! HTTP Server Module
//!
//! Accepts HTTP/1 connections on a TCP or Unix socket and answers each request through
//! the dispatcher. Concurrency is bounded by a semaphore; on shutdown the accept loop
//! stops and in-flight connections get a short drain period.

use crate::config::{ListenMode, ServeRoots, ServerConfig};
use crate::dispatcher::{Dispatch, ProxyDispatcher};
use crate::file_delivery::{self, empty_body, full_body, ResponseBody};
use crate::logging::{AccessLogEntry, LoggerManager};
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use hyper::body::Body;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How long in-flight connections may finish after the accept loop stops
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A bound listening socket
pub enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl BoundListener {
    /// Human-readable address for logs
    pub fn describe(&self) -> String {
        match self {
            BoundListener::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            BoundListener::Unix(_, path) => format!("unix:{}", path.display()),
        }
    }
}

/// Per-request state shared by every connection
pub struct RequestHandler {
    dispatcher: ProxyDispatcher,
    request_semaphore: Semaphore,
    active_connections: AtomicUsize,
    logger_manager: Option<Arc<LoggerManager>>,
}

impl RequestHandler {
    pub fn new(roots: Arc<ServeRoots>, max_concurrent_requests: usize) -> Self {
        Self {
            dispatcher: ProxyDispatcher::new(roots),
            request_semaphore: Semaphore::new(max_concurrent_requests),
            active_connections: AtomicUsize::new(0),
            logger_manager: None,
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Handle a single HTTP request; the request body is never read
    pub async fn handle_request<B>(&self, req: Request<B>, remote_addr: &str) -> Response<ResponseBody> {
        let start_time = Instant::now();

        let _permit = match self.request_semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Request limit exceeded, returning 503");
                let mut response = build_error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Too many concurrent requests",
                );
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
                return response;
            }
        };

        let (parts, _) = req.into_parts();
        debug!("Processing {} {} from {}", parts.method, parts.uri, remote_addr);

        let response = self.route(&parts).await;

        if let Some(logger) = &self.logger_manager {
            let bytes_sent = if parts.method == Method::HEAD {
                0
            } else {
                response_length(&response)
            };
            logger.log_access(&AccessLogEntry {
                remote_addr: remote_addr.to_string(),
                time: chrono::Local::now(),
                method: parts.method.to_string(),
                request_uri: parts.uri.to_string(),
                http_version: format!("{:?}", parts.version),
                http_status: response.status().as_u16(),
                bytes_sent,
                total_time_ms: start_time.elapsed().as_millis() as u64,
                user_agent: parts
                    .headers
                    .get(header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string()),
            });
        }

        response
    }

    async fn route(&self, parts: &hyper::http::request::Parts) -> Response<ResponseBody> {
        let path = match percent_decode_str(parts.uri.path()).decode_utf8() {
            Ok(path) => path.into_owned(),
            Err(e) => {
                debug!("Undecodable request path {}: {}", parts.uri.path(), e);
                return build_error_response(StatusCode::BAD_REQUEST, "Invalid request path");
            }
        };
        let sort = query_param(parts.uri.query(), "sort");

        let dispatcher = self.dispatcher.clone();
        let outcome =
            tokio::task::spawn_blocking(move || dispatcher.dispatch(&path, sort.as_deref()))
                .await
                .unwrap_or_else(|e| {
                    Err(ProxyError::SystemError(format!("Dispatch task failed: {}", e)))
                });

        let result = match outcome {
            Ok(Dispatch::NotHandled) => Ok(not_handled_response()),
            Ok(Dispatch::Redirect(location)) => redirect_response(&location, &parts.method),
            Ok(Dispatch::Listing(html)) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(full_body(html))
                .map_err(|e| ProxyError::HttpError(e.to_string())),
            Ok(Dispatch::AccelRedirect {
                accel_root,
                relative_path,
                local_path,
            }) => file_delivery::accel_redirect_response(&accel_root, &relative_path, &local_path),
            Ok(Dispatch::ServeFile(local_path)) => {
                file_delivery::serve_file(&local_path, &parts.method, &parts.headers).await
            }
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            if e.status_code().is_server_error() {
                error!("{} {}: {}", parts.method, parts.uri, e);
            } else {
                debug!("{} {}: {}", parts.method, parts.uri, e);
            }
            build_error_response(e.status_code(), &e.client_message())
        })
    }
}

/// HTTP server over a TCP or Unix socket
pub struct HttpServer {
    server_config: ServerConfig,
    handler: Arc<RequestHandler>,
}

impl HttpServer {
    pub fn new(server_config: ServerConfig, roots: Arc<ServeRoots>) -> Self {
        let handler = Arc::new(RequestHandler::new(
            roots,
            server_config.max_concurrent_requests,
        ));
        Self {
            server_config,
            handler,
        }
    }

    /// Set the logger manager for access logging; call before serving
    pub fn set_logger_manager(&mut self, logger_manager: Arc<LoggerManager>) {
        if let Some(handler) = Arc::get_mut(&mut self.handler) {
            handler.logger_manager = Some(logger_manager);
        }
    }

    pub fn handler(&self) -> Arc<RequestHandler> {
        Arc::clone(&self.handler)
    }

    /// Bind the configured socket
    pub async fn bind(&self) -> Result<BoundListener> {
        match self.server_config.listen {
            ListenMode::Tcp => {
                let addr = self.server_config.tcp_socket_addr()?;
                let listener = TcpListener::bind(addr).await?;
                Ok(BoundListener::Tcp(listener))
            }
            ListenMode::Unix => {
                let path = PathBuf::from(&self.server_config.address);
                let listener = UnixListener::bind(&path).map_err(|e| {
                    ProxyError::IoError(format!(
                        "Failed to bind unix socket {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(BoundListener::Unix(listener, path))
            }
        }
    }

    /// Bind and serve until shutdown
    pub async fn start(&self, shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal).await
    }

    /// Run the accept loop on an already bound socket
    pub async fn serve(&self, listener: BoundListener, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        info!("HTTP server listening on {}", listener.describe());

        match listener {
            BoundListener::Tcp(listener) => loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                debug!("HTTP connection from {}", addr);
                                if let Err(e) = stream.set_nodelay(true) {
                                    warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                                }
                                self.spawn_connection(stream, addr.ip().to_string());
                            }
                            Err(e) => error!("Failed to accept HTTP connection: {}", e),
                        }
                    }
                    _ = shutdown_signal.wait_for_shutdown() => {
                        info!("HTTP server received shutdown signal, stopping accept loop");
                        break;
                    }
                }
            },
            BoundListener::Unix(listener, _) => loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                debug!("HTTP connection on unix socket");
                                self.spawn_connection(stream, "-".to_string());
                            }
                            Err(e) => error!("Failed to accept HTTP connection: {}", e),
                        }
                    }
                    _ = shutdown_signal.wait_for_shutdown() => {
                        info!("HTTP server received shutdown signal, stopping accept loop");
                        break;
                    }
                }
            },
        }

        self.drain().await;
        info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S, remote_addr: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            serve_connection(stream, remote_addr, handler).await;
        });
    }

    /// Wait for in-flight connections to complete
    async fn drain(&self) {
        let drain_start = Instant::now();
        let active = self.handler.active_connections();
        if active == 0 {
            return;
        }

        info!(
            "HTTP server draining {} active connections (timeout: {:?})",
            active, DRAIN_TIMEOUT
        );
        while self.handler.active_connections() > 0 && drain_start.elapsed() < DRAIN_TIMEOUT {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.handler.active_connections();
        if remaining > 0 {
            warn!("HTTP server shutdown with {} connections still active", remaining);
        } else {
            info!("HTTP server all connections drained");
        }
    }
}

/// Serve a single HTTP connection
async fn serve_connection<S>(stream: S, remote_addr: String, handler: Arc<RequestHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    handler.active_connections.fetch_add(1, Ordering::Relaxed);

    let service_handler = Arc::clone(&handler);
    let service = service_fn(move |req| {
        let handler = Arc::clone(&service_handler);
        let remote_addr = remote_addr.clone();
        async move { Ok::<_, Infallible>(handler.handle_request(req, &remote_addr).await) }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        let err_str = err.to_string();
        if err_str.contains("connection closed")
            || err_str.contains("broken pipe")
            || err_str.contains("reset by peer")
            || err.is_canceled()
        {
            debug!("Client disconnected: {}", err);
        } else {
            error!("Error serving HTTP connection: {}", err);
        }
    }

    handler.active_connections.fetch_sub(1, Ordering::Relaxed);
}

/// Build a plain-text error response
pub fn build_error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let body = format!("{}\n", message);
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// Paths outside the proxy root get an empty 404
fn not_handled_response() -> Response<ResponseBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

fn redirect_response(location: &str, method: &Method) -> Result<Response<ResponseBody>> {
    let builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location);
    let response = if method == Method::GET {
        let href = crate::directory_lister::escape_html(location);
        builder
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full_body(format!("<a href=\"{}\">Found</a>.\n", href)))
    } else {
        builder.body(empty_body())
    };
    response.map_err(|e| ProxyError::HttpError(e.to_string()))
}

/// Bytes the response will carry, as far as it is known up front
fn response_length(response: &Response<ResponseBody>) -> u64 {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| response.body().size_hint().exact())
        .unwrap_or(0)
}

/// First value of `name` in a query string, form-decoded
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
        .next()
        .and_then(|value| {
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(|decoded| decoded.into_owned())
        })
}
