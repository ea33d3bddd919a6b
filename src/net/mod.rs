//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind with backlog, accept, TCP_NODELAY)
//!     → connection.rs (id + open-connection counter)
//!     → acceptor.rs (hand off to a worker, or start a session)
//!     → session.rs (read loop state, keep-alive, single close point)
//!     → Hand off to HTTP layer (parser, handler, response channel)
//! ```

pub mod acceptor;
pub mod connection;
pub mod error;
pub mod listener;
pub mod session;

pub use error::{ErrorKind, ServeError};
