//! Core types and traits for hostguard.
//!
//! This crate provides the data model shared by the security gate and the
//! plugin registry: error taxonomy, lifecycle states, the module ABI metadata,
//! generational module handles, and persisted plugin configuration.

mod config;
mod error;
mod handle;
mod state;
mod version;

pub use config::{ConfigError, ManagerSection, PluginConfig, RegistryFile};
pub use error::{PluginError, PluginErrorType, PluginFault, PluginResult, panic_message};
pub use handle::{HandleTable, ModuleHandle};
pub use state::PluginState;
pub use version::{ApiVersion, CURRENT_API_VERSION, PluginInfo};

/// Default ceiling on the number of registry entries.
pub const DEFAULT_MAX_PLUGINS: usize = 32;
