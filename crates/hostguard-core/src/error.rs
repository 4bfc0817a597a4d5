//! Error types for plugin lifecycle operations.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::state::PluginState;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Coarse classification of a plugin failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum PluginErrorType {
    LoadFailed,
    InitializationFailed,
    DependencyMissing,
    InvalidPlugin,
    SecurityViolation,
    RuntimeError,
    MemoryError,
}

/// Errors that can occur while managing plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The registry has not been initialized.
    #[error("Plugin registry not initialized")]
    NotInitialized,

    /// The registry is full.
    #[error("Plugin capacity limit reached: at most {limit} plugins may be loaded")]
    CapacityReached { limit: usize },

    /// Module file not found.
    #[error("Plugin file not found: {path}")]
    NotFound { path: PathBuf },

    /// No registry entry under this name.
    #[error("Plugin not found: {name}")]
    UnknownPlugin { name: String },

    /// The module could not be opened.
    #[error("Failed to load plugin '{name}': {message}")]
    LoadFailed { name: String, message: String },

    /// The module does not satisfy the plugin ABI.
    #[error("Invalid plugin '{name}': {message}")]
    InvalidPlugin { name: String, message: String },

    /// The module targets an incompatible interface version.
    #[error("Plugin '{name}' requires API {found}, host provides {required}")]
    IncompatibleApi {
        name: String,
        required: String,
        found: String,
    },

    /// The initialization hook failed or panicked.
    #[error("Plugin '{name}' failed to initialize: {message}")]
    InitializationFailed { name: String, message: String },

    /// One or more declared dependencies are not active.
    #[error("Plugin '{name}' is missing dependencies: {}", missing.join(", "))]
    DependencyMissing { name: String, missing: Vec<String> },

    /// Active plugins still depend on this one.
    #[error("Plugin '{name}' is required by active plugins: {}", dependents.join(", "))]
    DependentsActive {
        name: String,
        dependents: Vec<String>,
    },

    /// The requested plugin set contains a dependency cycle.
    #[error("Circular dependency detected among: {}", cycle.join(", "))]
    CircularDependency { cycle: Vec<String> },

    /// The security gate rejected the module.
    #[error("Security violation for plugin '{name}': {message}")]
    SecurityViolation { name: String, message: String },

    /// A lifecycle hook panicked at runtime.
    #[error("Plugin '{name}' runtime error: {message}")]
    Runtime { name: String, message: String },

    /// A state change that the lifecycle does not allow.
    #[error("Plugin '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: PluginState,
        to: PluginState,
    },

    /// A module handle that no longer refers to an open module.
    #[error("Stale module handle")]
    StaleHandle,

    /// Configuration persistence error.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Map this error onto the plugin failure taxonomy.
    pub fn kind(&self) -> PluginErrorType {
        match self {
            Self::InvalidPlugin { .. } | Self::IncompatibleApi { .. } => {
                PluginErrorType::InvalidPlugin
            }
            Self::InitializationFailed { .. } => PluginErrorType::InitializationFailed,
            Self::DependencyMissing { .. } | Self::CircularDependency { .. } => {
                PluginErrorType::DependencyMissing
            }
            Self::SecurityViolation { .. } => PluginErrorType::SecurityViolation,
            Self::Runtime { .. } | Self::InvalidTransition { .. } => PluginErrorType::RuntimeError,
            Self::Io(err) if err.kind() == std::io::ErrorKind::OutOfMemory => {
                PluginErrorType::MemoryError
            }
            _ => PluginErrorType::LoadFailed,
        }
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "plugin panicked".to_string()
    }
}

/// A failure recorded against a single plugin entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginFault {
    /// Failure class.
    pub kind: PluginErrorType,
    /// Short message.
    pub message: String,
    /// Longer diagnostic detail.
    pub details: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl PluginFault {
    /// Create a fault stamped with the current time.
    pub fn new(kind: PluginErrorType, message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&PluginError> for PluginFault {
    fn from(err: &PluginError) -> Self {
        Self::new(err.kind(), err.kind().to_string(), err.to_string())
    }
}
