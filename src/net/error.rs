//! Per-connection failures reported through the request handler.

use crate::cluster::{HandoffError, WorkerId};
use crate::http::parser::ParseError;
use crate::net::connection::ConnectionId;

/// Everything the accept loop or a session can report to the handler.
///
/// None of these stop the server: each one is isolated to the connection it
/// names and surfaced exactly once.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// `accept(2)` failed. No session was created.
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The peer ended the stream. This is the normal end of a session.
    #[error("{connection} closed by peer")]
    ConnectionClosed { connection: ConnectionId },

    /// The peer sent bytes that are not a valid request.
    #[error("Malformed request on {connection}: {source}")]
    Parse {
        connection: ConnectionId,
        #[source]
        source: ParseError,
    },

    /// The connection could not be transferred to a worker and was dropped.
    #[error("Failed to hand {connection} to {worker}: {source}")]
    Handoff {
        connection: ConnectionId,
        worker: WorkerId,
        #[source]
        source: HandoffError,
    },

    /// Reading from the socket failed.
    #[error("Read failed on {connection}: {source}")]
    Io {
        connection: ConnectionId,
        #[source]
        source: std::io::Error,
    },
}

/// Discriminant of [`ServeError`], convenient for matching and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AcceptFailed,
    ConnectionClosed,
    Parse,
    Handoff,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AcceptFailed => "accept_failed",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::Parse => "parse",
            ErrorKind::Handoff => "handoff",
            ErrorKind::Io => "io",
        }
    }
}

impl ServeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServeError::AcceptFailed(_) => ErrorKind::AcceptFailed,
            ServeError::ConnectionClosed { .. } => ErrorKind::ConnectionClosed,
            ServeError::Parse { .. } => ErrorKind::Parse,
            ServeError::Handoff { .. } => ErrorKind::Handoff,
            ServeError::Io { .. } => ErrorKind::Io,
        }
    }

    /// The connection this error belongs to, if a session existed.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            ServeError::AcceptFailed(_) => None,
            ServeError::ConnectionClosed { connection }
            | ServeError::Parse { connection, .. }
            | ServeError::Handoff { connection, .. }
            | ServeError::Io { connection, .. } => Some(*connection),
        }
    }
}
