//! HTTP server implementation

use crate::dispatcher::Dispatcher;
use crate::shutdown::ShutdownSignal;
use crate::RuntimeState;
use http::Request;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use portcullis_config::Config;
use portcullis_core::{ConnInfo, Error, Result};
use portcullis_plugins::SniffRouter;
use portcullis_proxy::{ForwardOptions, ForwardingEngine, HttpClient};
use portcullis_rules::{PathBlockTable, RedirectTable};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

/// HTTP server
#[derive(Debug)]
pub struct Server {
    config: Config,
    dispatcher: Dispatcher,
    state: Arc<RwLock<RuntimeState>>,
    shutdown: ShutdownSignal,
    active_connections: Arc<AtomicUsize>,
}

/// Decrements the live connection count when a connection task ends
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Get the current state
    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Get listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.config.gateway.listen
    }

    /// Request pipeline
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Connections currently being served
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get shutdown signal
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr()).await.map_err(|e| {
            Error::config(format!("Failed to bind to {}: {e}", self.listen_addr()))
        })?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown, then drain
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        *self.state.write().await = RuntimeState::Running;

        tracing::info!(
            listen = %listener.local_addr()?,
            upstream = %self.config.upstream.target,
            "Server listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::trace!("Accepted connection from {}", addr);
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = self.shutdown.triggered() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        *self.state.write().await = RuntimeState::ShuttingDown;
        self.drain().await;
        *self.state.write().await = RuntimeState::Stopped;

        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let guard = ConnectionGuard::new(&self.active_connections);
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        let conn_info = ConnInfo::new(addr);

        tokio::spawn(async move {
            let _guard = guard;

            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let dispatcher = dispatcher.clone();
                async move {
                    let mut req = req.map(|body| body.boxed());
                    req.extensions_mut().insert(conn_info);
                    Ok::<_, Infallible>(dispatcher.handle(req).await)
                }
            });

            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.triggered() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };

            if let Err(e) = result {
                tracing::debug!(remote = %addr, error = %e, "Connection closed with error");
            }
        });
    }

    async fn drain(&self) {
        let shutdown_timeout = self.config.gateway.shutdown_timeout;
        let start = std::time::Instant::now();

        tracing::info!(
            timeout_secs = shutdown_timeout.as_secs(),
            "Waiting for open connections to finish"
        );

        loop {
            let active = self.active_connections();

            if active == 0 {
                tracing::info!("All connections closed, shutting down cleanly");
                break;
            }

            if start.elapsed() >= shutdown_timeout {
                tracing::warn!(
                    active_connections = active,
                    "Shutdown timeout reached, forcing shutdown"
                );
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::info!(
            shutdown_duration_ms = start.elapsed().as_millis(),
            "Server stopped"
        );
    }
}

/// Server builder
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: Option<Config>,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the server: open rule tables, register plugins, create the engine
    pub fn build(self) -> Result<Server> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("config is required".to_string()))?;

        let upstream = &config.upstream;
        let client = HttpClient::with_options(config.gateway.request_timeout, upstream.max_idle_per_host);

        let options = ForwardOptions {
            flush_interval: upstream.flush_interval()?,
            tunnel_timeout: upstream.tunnel_timeout,
            no_cache: upstream.no_cache,
            upstream_headers: upstream.upstream_headers.clone(),
            downstream_headers: upstream.downstream_headers.clone(),
            preserve_host: upstream.preserve_host,
            host_override: upstream.host_override.clone(),
            ..ForwardOptions::default()
        };
        let engine = ForwardingEngine::new(&upstream.target, client.clone(), options)?;

        let blocks = PathBlockTable::open(&config.rules.block_dir)?;
        let redirects = RedirectTable::open(&config.rules.redirect_dir, config.rules.allow_regex)?;

        let plugins = SniffRouter::new(client);
        for plugin in &config.plugins {
            if let Err(e) = plugins.register(plugin) {
                tracing::error!(plugin = %plugin.id, error = %e, "Plugin registration failed");
            }
        }

        tracing::info!(
            upstream = %upstream.target,
            block_rules = blocks.list_blocking_paths().len(),
            redirect_rules = redirects.get_all_rules().len(),
            plugins = config.plugins.len(),
            "Server components initialized"
        );

        let dispatcher = Dispatcher::new(
            Arc::new(blocks),
            Arc::new(redirects),
            Arc::new(plugins),
            Arc::new(engine),
        );

        Ok(Server {
            config,
            dispatcher,
            state: Arc::new(RwLock::new(RuntimeState::Initializing)),
            shutdown: ShutdownSignal::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_config::ConfigBuilder;

    fn test_config(dir: &std::path::Path) -> Config {
        ConfigBuilder::new()
            .listen("127.0.0.1:8080".parse().unwrap())
            .target("http://127.0.0.1:9000")
            .rules_root(dir)
            .build()
            .unwrap()
    }

    #[test]
    fn test_server_builder() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerBuilder::new().config(test_config(dir.path())).build().unwrap();

        assert_eq!(server.listen_addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(server.active_connections(), 0);
        assert!(dir.path().join("redirect").is_dir());
        assert!(dir.path().join("pathblock").is_dir());
    }

    #[test]
    fn test_server_builder_no_config() {
        let result = ServerBuilder::new().build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(ServerBuilder::new().config(test_config(dir.path())).build().unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.serve(listener).await });

        while server.state().await != RuntimeState::Running {
            tokio::task::yield_now().await;
        }
        server.shutdown_signal().trigger();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(server.state().await, RuntimeState::Stopped);
    }
}
