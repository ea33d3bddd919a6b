//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (backlog > 0, request ceiling > 0)
//! - Check role-specific requirements (worker count, cluster socket)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{Role, ServerConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate a configuration, collecting every error found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.backlog == 0 {
        errors.push(ValidationError::new("listener.backlog", "must be positive"));
    }

    if config.cluster.role != Role::Worker
        && config.listener.bind_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    if config.keep_alive.max_requests == 0 {
        errors.push(ValidationError::new(
            "keep_alive.max_requests",
            "must be positive",
        ));
    }

    if config.cluster.role == Role::Master && config.cluster.workers == 0 {
        errors.push(ValidationError::new(
            "cluster.workers",
            "a master needs at least one worker",
        ));
    }

    if config.cluster.role != Role::Standalone && config.cluster.socket_path.as_os_str().is_empty() {
        errors.push(ValidationError::new(
            "cluster.socket_path",
            "required for master and worker roles",
        ));
    }

    if config.cluster.respawn_base_delay_ms > config.cluster.respawn_max_delay_ms {
        errors.push(ValidationError::new(
            "cluster.respawn_base_delay_ms",
            "must not exceed respawn_max_delay_ms",
        ));
    }

    if config.limits.max_head_bytes == 0 || config.limits.max_headers == 0 {
        errors.push(ValidationError::new("limits", "head limits must be positive"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!(
                "'{}' is not a socket address",
                config.observability.metrics_address
            ),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
