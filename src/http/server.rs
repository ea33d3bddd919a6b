//! HTTP server façade.
//!
//! # Responsibilities
//! - Hold configuration until `listen` and validate façade options
//! - Bind the listening socket (master, standalone)
//! - Start the accept loop, or the transferred-handle loop in a worker
//! - Stop accepting on `close()`
//! - Expose the open-connection count

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cluster::{ClusterView, HandleReceiver};
use crate::config::validation::validate_config;
use crate::config::{ConfigError, Role, ServerConfig, ServerOptions};
use crate::http::handler::RequestHandler;
use crate::lifecycle::signals::ignore_sigpipe;
use crate::lifecycle::Shutdown;
use crate::net::acceptor::Acceptor;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{BindError, Listener};
use crate::net::session::SessionArena;

/// A single-process HTTP/1.x server that may act as a cluster master or worker.
pub struct HttpServer {
    config: ServerConfig,
    cluster: ClusterView,
    tracker: ConnectionTracker,
    sessions: SessionArena,
    listener: Mutex<Option<Listener>>,
    shutdown: Shutdown,
    closed: AtomicBool,
}

impl HttpServer {
    /// Create a server whose cluster view follows `config.cluster.role`.
    ///
    /// A master built this way has an empty registry and serves locally; use
    /// [`HttpServer::with_cluster`] to share a registry fed by a
    /// [`crate::cluster::ClusterListener`].
    pub fn new(config: ServerConfig) -> Self {
        let cluster = match config.cluster.role {
            Role::Worker => ClusterView::worker(),
            _ => ClusterView::standalone().with_role(config.cluster.role),
        };
        Self::with_cluster(config, cluster)
    }

    pub fn with_cluster(mut config: ServerConfig, cluster: ClusterView) -> Self {
        config.cluster.role = cluster.role();
        Self {
            config,
            cluster,
            tracker: ConnectionTracker::new(),
            sessions: SessionArena::new(),
            listener: Mutex::new(None),
            shutdown: Shutdown::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Apply options before `listen`. Nothing changes if validation fails.
    pub fn configure(&mut self, options: ServerOptions) -> Result<(), ConfigError> {
        let mut next = self.config.clone();
        next.apply(&options);
        validate_config(&next).map_err(ConfigError::Validation)?;

        if next.cluster.role != self.cluster.role() {
            self.cluster = self.cluster.clone().with_role(next.cluster.role);
        }
        self.config = next;
        Ok(())
    }

    /// Bind the listening socket and return its local address.
    pub fn bind(&self, address: &str) -> Result<SocketAddr, BindError> {
        let mut listener_config = self.config.listener.clone();
        listener_config.bind_address = address.to_string();
        let listener = Listener::bind(&listener_config)?;
        let local_addr = listener.local_addr().map_err(|source| BindError::Io {
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
            source,
        })?;
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(local_addr)
    }

    /// Serve until [`HttpServer::close`] is called.
    ///
    /// Master and standalone serve the socket from [`HttpServer::bind`]; a
    /// worker connects to the master's cluster socket and serves the
    /// connections it receives.
    pub async fn listen<H: RequestHandler>(&self, handler: H) -> Result<(), BindError> {
        if let Err(e) = ignore_sigpipe() {
            tracing::warn!(error = %e, "Failed to ignore SIGPIPE");
        }

        let shutdown = self.shutdown.subscribe();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let acceptor = Arc::new(Acceptor::new(
            Arc::new(self.config.clone()),
            self.cluster.clone(),
            self.tracker.clone(),
            self.sessions.clone(),
            Arc::new(handler),
        ));

        match self.cluster.role() {
            Role::Worker => {
                let path = self.config.cluster.socket_path.clone();
                let receiver = HandleReceiver::connect(&path)
                    .await
                    .map_err(|source| BindError::Cluster { path: path.clone(), source })?;
                tracing::info!(path = %path.display(), pid = std::process::id(), "Connected to master");
                acceptor.run_transferred(receiver, shutdown).await;
            }
            Role::Master | Role::Standalone => {
                let listener = self
                    .listener
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .ok_or(BindError::NotBound)?;
                acceptor.run(listener, shutdown).await;
            }
        }
        Ok(())
    }

    /// Stop accepting and release the listening socket. Idempotent.
    ///
    /// Open sessions are left to finish; see [`HttpServer::drain`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(clients_connected = self.clients_connected(), "Server closing");
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shutdown.trigger();
    }

    /// Wait up to `timeout` for open sessions to finish.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.wait_for_drain(timeout).await
    }

    /// Close every open session.
    pub fn close_sessions(&self) {
        self.sessions.close_all();
    }

    /// Number of open sessions in this process.
    pub fn clients_connected(&self) -> u64 {
        self.tracker.active_count()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }
}
