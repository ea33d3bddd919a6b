//! Multi-process HTTP/1.x server with connection handoff.
//!
//! A master process accepts TCP connections and passes each raw socket to a
//! worker process in round-robin order; workers (or a standalone process)
//! parse requests and hand them to the application's [`RequestHandler`].

pub mod cluster;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ServerConfig;
pub use http::{HttpServer, RequestHandler, ResponseChannel};
pub use lifecycle::Shutdown;
pub use net::ServeError;
