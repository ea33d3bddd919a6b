//! Startup orchestration.
//!
//! # Responsibilities
//! - Start the metrics exporter when enabled
//! - Boot the role: standalone server, master (cluster listener, supervisor,
//!   accept loop) or worker (transferred-handle loop)
//! - Wire SIGINT/SIGTERM to `close()` and drain sessions before returning
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The master binds its cluster socket before spawning workers so their
//!   first connect succeeds

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::Response;

use crate::cluster::{ClusterListener, ClusterView, Supervisor, WorkerRegistry};
use crate::config::{Role, ServerConfig};
use crate::http::handler::HandlerInput;
use crate::http::HttpServer;
use crate::lifecycle::signals::shutdown_signal;
use crate::lifecycle::Shutdown;
use crate::net::listener::BindError;
use crate::net::ErrorKind;
use crate::observability::metrics;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("Failed to bind cluster socket {path}: {source}")]
    ClusterSocket {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot locate own executable: {0}")]
    CurrentExe(#[source] std::io::Error),
    #[error("Invalid metrics address '{0}'")]
    MetricsAddress(String),
    #[error("Failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Run this process in its configured role until shutdown.
///
/// `config_path` is forwarded to spawned workers.
pub async fn run(config: ServerConfig, config_path: Option<PathBuf>) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        let address = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::MetricsAddress(config.observability.metrics_address.clone()))?;
        metrics::init_metrics(address)?;
    }

    tracing::info!(
        role = %config.cluster.role,
        pid = std::process::id(),
        keep_alive_timeout_secs = config.keep_alive.timeout_secs,
        keep_alive_max_requests = config.keep_alive.max_requests,
        "cluster-http starting"
    );

    match config.cluster.role {
        Role::Standalone => serve(config, ClusterView::standalone()).await,
        Role::Worker => serve(config, ClusterView::worker()).await,
        Role::Master => run_master(config, config_path).await,
    }
}

async fn run_master(config: ServerConfig, config_path: Option<PathBuf>) -> Result<(), StartupError> {
    let registry = Arc::new(WorkerRegistry::new());
    let shutdown = Shutdown::new();
    let socket_path = config.cluster.socket_path.clone();

    let cluster_listener = ClusterListener::bind(&socket_path, Arc::clone(&registry)).map_err(|source| {
        StartupError::ClusterSocket {
            path: socket_path.clone(),
            source,
        }
    })?;
    let cluster_task = tokio::spawn(cluster_listener.run(shutdown.subscribe()));

    let program = std::env::current_exe().map_err(StartupError::CurrentExe)?;
    let supervisor = Supervisor::new(&config.cluster, program, worker_args(config_path, socket_path));
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    let served = serve(config, ClusterView::master(registry)).await;

    shutdown.trigger();
    let _ = supervisor_task.await;
    let _ = cluster_task.await;
    served
}

fn worker_args(config_path: Option<PathBuf>, socket_path: PathBuf) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(path) = config_path {
        args.push(OsString::from("--config"));
        args.push(path.into_os_string());
    }
    args.push(OsString::from("worker"));
    args.push(OsString::from("--cluster-socket"));
    args.push(socket_path.into_os_string());
    args
}

async fn serve(config: ServerConfig, cluster: ClusterView) -> Result<(), StartupError> {
    let drain_timeout = Duration::from_secs(config.shutdown.drain_timeout_secs);
    let bind_address = config.listener.bind_address.clone();
    let server = Arc::new(HttpServer::with_cluster(config, cluster));

    if server.cluster().role() != Role::Worker {
        let local_addr = server.bind(&bind_address)?;
        tracing::info!(address = %local_addr, "Listening for connections");
    }

    let closer = Arc::clone(&server);
    tokio::spawn(async move {
        shutdown_signal().await;
        closer.close();
    });

    server.listen(hello).await?;

    if !server.drain(drain_timeout).await {
        tracing::warn!(
            clients_connected = server.clients_connected(),
            "Drain timeout elapsed; closing remaining sessions"
        );
        server.close_sessions();
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Demo handler: answers every request with the serving process id.
fn hello(input: HandlerInput) {
    match input {
        Ok((request, channel)) => {
            tokio::spawn(async move {
                let body = format!("Hello from pid {} ({})\n", std::process::id(), request.uri().path());
                let mut response = Response::new(Bytes::from(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                if let Err(e) = channel.send(response).await {
                    tracing::debug!(error = %e, "Failed to send response");
                }
            });
        }
        Err(e) if e.kind() == ErrorKind::ConnectionClosed => {
            tracing::trace!(error = %e, "Session ended");
        }
        Err(e) => tracing::debug!(error = %e, "Session error"),
    }
}
