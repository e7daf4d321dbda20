use std::path::PathBuf;

use aikore_instance::{InstanceId, InstanceStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance not found: {0}")]
    NotFound(InstanceId),

    #[error("instance already running: {0}")]
    AlreadyRunning(InstanceId),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("blueprint not found: {name} (searched {searched:?})")]
    BlueprintNotFound { name: String, searched: Vec<PathBuf> },

    #[error("no free port in pool {start}-{end}")]
    PoolExhausted { start: u16, end: u16 },

    #[error("port {port} is outside pool {start}-{end}")]
    PortOutOfRange { port: u16, start: u16, end: u16 },

    #[error("port {0} is already claimed by another instance")]
    PortInUse(u16),

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    #[error("failed to request proxy reload: {0}")]
    Reload(#[source] std::io::Error),

    #[error("failed to spawn instance: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("terminal error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InstanceError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            InstanceError::NotFound(_) => "not_found",
            InstanceError::AlreadyRunning(_) => "already_running",
            InstanceError::Configuration(_) => "configuration",
            InstanceError::BlueprintNotFound { .. } => "blueprint_not_found",
            InstanceError::PoolExhausted { .. } => "pool_exhausted",
            InstanceError::PortOutOfRange { .. } => "port_out_of_range",
            InstanceError::PortInUse(_) => "port_in_use",
            InstanceError::IllegalTransition { .. } => "illegal_transition",
            InstanceError::Reload(_) => "reload_failed",
            InstanceError::Spawn(_) => "spawn_failed",
            InstanceError::Pty(_) => "terminal_failed",
            InstanceError::Io(_) => "io",
            InstanceError::Json(_) => "json",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            InstanceError::AlreadyRunning(_) => Some("Stop the instance first.".to_string()),
            InstanceError::BlueprintNotFound { .. } => Some(
                "Check the blueprint name, or copy the script into the custom blueprints directory."
                    .to_string(),
            ),
            InstanceError::PoolExhausted { .. } => Some(
                "Stop another instance, or widen AIKORE_PORT_RANGE.".to_string(),
            ),
            InstanceError::PortOutOfRange { start, end, .. } => {
                Some(format!("Pick a port in {start}-{end}, or leave it empty."))
            }
            InstanceError::Reload(_) => Some(
                "The rule file was written; it becomes live on the next proxy reload.".to_string(),
            ),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, InstanceError>;
