//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated)
//!     → HttpServer::configure (façade options applied before listen)
//!     → shared via Arc with the acceptor and every session
//! ```
//!
//! # Design Decisions
//! - Config is immutable once `listen` begins
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ClusterConfig, KeepAliveConfig, LimitsConfig, ListenerConfig, LogFormat,
    ObservabilityConfig, Role, ServerConfig, ServerOptions, ShutdownConfig,
};
