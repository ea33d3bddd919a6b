//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, backlog, TCP options).
    pub listener: ListenerConfig,

    /// Persistent-connection policy.
    pub keep_alive: KeepAliveConfig,

    /// Process role and worker pool settings.
    pub cluster: ClusterConfig,

    /// Request parser limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Shutdown behaviour.
    pub shutdown: ShutdownConfig,
}

impl ServerConfig {
    /// Apply façade-level options on top of the loaded configuration.
    pub fn apply(&mut self, options: &ServerOptions) {
        if let Some(backlog) = options.backlog {
            self.listener.backlog = backlog;
        }
        if let Some(timeout) = options.keep_alive_timeout_secs {
            self.keep_alive.timeout_secs = timeout;
        }
        if let Some(max) = options.keep_alive_max_requests {
            self.keep_alive.max_requests = max;
        }
        if let Some(no_delay) = options.no_delay {
            self.listener.no_delay = no_delay;
        }
        if let Some(role) = options.role {
            self.cluster.role = role;
        }
    }
}

/// The subset of settings `HttpServer::configure` accepts.
///
/// Unset fields leave the current value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerOptions {
    pub backlog: Option<u32>,
    pub keep_alive_timeout_secs: Option<u64>,
    pub keep_alive_max_requests: Option<u32>,
    pub no_delay: Option<bool>,
    pub role: Option<Role>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum pending connections handed to `listen(2)`.
    pub backlog: u32,

    /// Disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            backlog: 1024,
            no_delay: false,
        }
    }
}

/// Keep-alive configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Idle deadline between requests in seconds. 0 disables keep-alive.
    pub timeout_secs: u64,

    /// Maximum requests served on one connection.
    pub max_requests: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_requests: 100,
        }
    }
}

impl KeepAliveConfig {
    /// Whether connections may outlive their first request.
    pub fn enabled(&self) -> bool {
        self.timeout_secs > 0
    }

    /// Idle deadline as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which part a process plays in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the listening socket and fans connections out to workers.
    Master,
    /// Receives connection handles from a master and serves them.
    Worker,
    /// Accepts and serves connections itself.
    #[default]
    Standalone,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Worker => write!(f, "worker"),
            Role::Standalone => write!(f, "standalone"),
        }
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Role of this process.
    pub role: Role,

    /// Number of worker processes a master spawns.
    pub workers: usize,

    /// Unix socket the master listens on for worker registrations.
    pub socket_path: PathBuf,

    /// Respawn workers that exit while the master is running.
    pub respawn: bool,

    /// Base delay for respawn backoff in milliseconds.
    pub respawn_base_delay_ms: u64,

    /// Maximum delay for respawn backoff in milliseconds.
    pub respawn_max_delay_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: Role::Standalone,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            socket_path: std::env::temp_dir().join("cluster-http.sock"),
            respawn: true,
            respawn_base_delay_ms: 100,
            respawn_max_delay_ms: 5000,
        }
    }
}

/// Request parser limits.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of the request line plus headers.
    pub max_head_bytes: usize,

    /// Maximum number of header fields.
    pub max_headers: usize,

    /// Maximum request body size.
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_headers: 100,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long to wait for open sessions to finish after accepting stops.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.listener.backlog, 1024);
        assert_eq!(config.keep_alive.timeout_secs, 15);
        assert_eq!(config.keep_alive.max_requests, 100);
        assert!(!config.listener.no_delay);
        assert_eq!(config.cluster.role, Role::Standalone);
    }

    #[test]
    fn options_override_only_set_fields() {
        let mut config = ServerConfig::default();
        config.apply(&ServerOptions {
            keep_alive_timeout_secs: Some(0),
            role: Some(Role::Master),
            ..Default::default()
        });
        assert!(!config.keep_alive.enabled());
        assert_eq!(config.cluster.role, Role::Master);
        assert_eq!(config.listener.backlog, 1024);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [keep_alive]
            max_requests = 5

            [cluster]
            role = "worker"
            "#,
        )
        .unwrap();
        assert_eq!(config.keep_alive.max_requests, 5);
        assert_eq!(config.keep_alive.timeout_secs, 15);
        assert_eq!(config.cluster.role, Role::Worker);
    }
}
