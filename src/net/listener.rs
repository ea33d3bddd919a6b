//! TCP listener implementation.
//!
//! # Responsibilities
//! - Bind to the configured address with the configured backlog
//! - Accept incoming TCP connections
//! - Apply per-socket options (TCP_NODELAY)

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::ListenerConfig;

/// Error type for bind operations. Fatal to `listen`, never retried.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The address could not be parsed.
    #[error("Invalid bind address '{address}': {source}")]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },
    /// The socket layer refused to bind or listen.
    #[error("Failed to bind {address}: {source}")]
    Io {
        address: SocketAddr,
        source: std::io::Error,
    },
    /// `listen` was called without a prior successful `bind`.
    #[error("Server is not bound")]
    NotBound,
    /// Worker role could not reach its master.
    #[error("Failed to reach master at {path}: {source}")]
    Cluster {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

/// A bound TCP listener.
#[derive(Debug)]
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Whether to set TCP_NODELAY on accepted sockets.
    no_delay: bool,
}

impl Listener {
    /// Bind to the configured address.
    pub fn bind(config: &ListenerConfig) -> Result<Self, BindError> {
        let addr: SocketAddr =
            config
                .bind_address
                .parse()
                .map_err(|source| BindError::InvalidAddress {
                    address: config.bind_address.clone(),
                    source,
                })?;

        let io_err = |source| BindError::Io {
            address: addr,
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(io_err)?;
        socket.set_reuseaddr(true).map_err(io_err)?;
        socket.bind(addr).map_err(io_err)?;
        let listener = socket.listen(config.backlog).map_err(io_err)?;

        let local_addr = listener.local_addr().map_err(io_err)?;

        tracing::info!(
            address = %local_addr,
            backlog = config.backlog,
            no_delay = config.no_delay,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            no_delay: config.no_delay,
        })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;

        if self.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        tracing::debug!(peer_addr = %addr, "Connection accepted");

        Ok((stream, addr))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}
