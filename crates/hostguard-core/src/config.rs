//! Per-plugin configuration and its on-disk form.
//!
//! Registry state is persisted as a section-per-plugin TOML document:
//!
//! ```toml
//! [PluginManager]
//! MaxPluginCount = 32
//! PluginDirectory = "plugins"
//!
//! [Plugin.viewer]
//! Enabled = true
//! AutoLoad = true
//! Priority = 10
//! theme = "dark"
//! ```
//!
//! Keys other than `Enabled`, `AutoLoad` and `Priority` are kept as free-form
//! string parameters.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DEFAULT_MAX_PLUGINS;

/// Errors reading or writing configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file could not be written.
    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file contents are not valid.
    #[error("Invalid config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The in-memory state could not be serialized.
    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    /// A value failed validation.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Host-side settings for one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Whether the plugin participates in update and render.
    #[serde(rename = "Enabled", default = "default_true")]
    pub enabled: bool,

    /// Whether the plugin is loaded by `auto_load`.
    #[serde(rename = "AutoLoad", default)]
    pub auto_load: bool,

    /// Ordering hint; higher loads earlier among independent plugins.
    #[serde(rename = "Priority", default)]
    pub priority: i32,

    /// Free-form parameters handed to the host.
    #[serde(flatten)]
    pub parameters: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_load: false,
            priority: 0,
            parameters: BTreeMap::new(),
        }
    }
}

impl PluginConfig {
    /// Mark the plugin for automatic loading.
    pub fn with_auto_load(mut self, auto_load: bool) -> Self {
        self.auto_load = auto_load;
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a free-form parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Get a free-form parameter.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// The `[PluginManager]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(rename = "MaxPluginCount", default = "default_max_plugins")]
    pub max_plugin_count: usize,

    #[serde(rename = "PluginDirectory", default = "default_plugin_dir")]
    pub plugin_directory: PathBuf,
}

fn default_max_plugins() -> usize {
    DEFAULT_MAX_PLUGINS
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            max_plugin_count: default_max_plugins(),
            plugin_directory: default_plugin_dir(),
        }
    }
}

/// Whole registry configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(rename = "PluginManager", default)]
    pub manager: ManagerSection,

    #[serde(rename = "Plugin", default)]
    pub plugins: IndexMap<String, PluginConfig>,
}

impl RegistryFile {
    /// Parse a registry document from a string.
    pub fn from_toml(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let file: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if file.manager.max_plugin_count == 0 {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                message: "MaxPluginCount must be at least 1".to_string(),
            });
        }
        Ok(file)
    }

    /// Read a registry document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(path, &text)
    }

    /// Render this document as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Write this document to disk, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
