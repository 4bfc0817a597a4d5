//! Module ABI metadata.

use serde::{Deserialize, Serialize};

/// Version of the host/plugin interface a module was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// The interface version this host exposes.
pub const CURRENT_API_VERSION: ApiVersion = ApiVersion::new(1, 0, 0);

impl ApiVersion {
    /// Create a new version triple.
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether `self` can stand in for a module requiring `required`.
    ///
    /// Majors must match exactly; the candidate minor must be at least the
    /// required minor. Patch levels never affect compatibility.
    pub fn is_compatible(&self, required: &ApiVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        CURRENT_API_VERSION
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Descriptive metadata a module reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Interface version the module was compiled against.
    #[serde(default)]
    pub api_version: ApiVersion,

    /// Plugin name.
    pub name: String,

    /// Plugin version.
    #[serde(default)]
    pub version: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Plugin author.
    #[serde(default)]
    pub author: String,

    /// Names of plugins that must be active before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginInfo {
    /// Create metadata with a name and version, targeting the current API.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    /// Declare a dependency on another plugin.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Set the interface version.
    pub fn with_api_version(mut self, version: ApiVersion) -> Self {
        self.api_version = version;
        self
    }
}
