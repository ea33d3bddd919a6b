//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! session bytes
//!     → parser.rs (HTTP/1.x request framing)
//!     → handler.rs (application callback)
//!     → response.rs (serialize response, complete the cycle)
//! ```
//!
//! server.rs is the façade that wires configuration, the listener and the
//! cluster view together.

pub mod handler;
pub mod parser;
pub mod response;
pub mod server;

pub use handler::{HandlerInput, RequestHandler};
pub use parser::{ParseError, Request};
pub use response::{ResponseChannel, ResponseError};
pub use server::HttpServer;
