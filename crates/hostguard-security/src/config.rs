//! Security configuration and the policy file.
//!
//! The policy file is TOML:
//!
//! ```toml
//! [security]
//! enable_signature_verification = true
//! max_log_entries = 10000
//! trusted_directories = ["/opt/app/plugins"]
//!
//! [security.signature_policy]
//! trusted_publishers = ["Example Corp"]
//!
//! [[file_access]]
//! pattern = "*.txt"
//! allowed = ["Read"]
//! priority = 10
//! ```

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{SecurityError, SecurityResult};
use crate::hijack::compile_blocklist;
use crate::policy::FileAccessPolicy;
use crate::signature::SignaturePolicy;

/// Toggles and lists that drive the security gate.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct SecurityConfiguration {
    #[builder(default = "true")]
    pub enable_signature_verification: bool,

    #[builder(default = "true")]
    pub enable_file_access_control: bool,

    /// Covers load-path classification, hijack detection and the blocklist.
    #[builder(default = "true")]
    pub enable_hijack_prevention: bool,

    /// Keep events in the log. Statistics are kept either way.
    #[builder(default = "true")]
    pub enable_logging: bool,

    #[builder(default = "10_000")]
    pub max_log_entries: usize,

    /// Directories modules may always be loaded from.
    #[builder(default)]
    pub trusted_directories: Vec<PathBuf>,

    #[builder(default)]
    pub revoked_thumbprints: Vec<String>,

    /// Case-insensitive glob patterns on module file names.
    #[builder(default = "default_blocked_patterns()")]
    pub blocked_module_patterns: Vec<String>,

    #[builder(default)]
    pub signature_policy: SignaturePolicy,
}

fn default_blocked_patterns() -> Vec<String> {
    ["*hook*", "*inject*", "*keylog*"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SecurityConfiguration {
    fn default() -> Self {
        Self {
            enable_signature_verification: true,
            enable_file_access_control: true,
            enable_hijack_prevention: true,
            enable_logging: true,
            max_log_entries: 10_000,
            trusted_directories: Vec::new(),
            revoked_thumbprints: Vec::new(),
            blocked_module_patterns: default_blocked_patterns(),
            signature_policy: SignaturePolicy::default(),
        }
    }
}

impl SecurityConfigurationBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_log_entries == Some(0) {
            return Err("max_log_entries must be at least 1".to_string());
        }
        if let Some(patterns) = &self.blocked_module_patterns {
            compile_blocklist(patterns).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl SecurityConfiguration {
    /// Create a new configuration builder.
    pub fn builder() -> SecurityConfigurationBuilder {
        SecurityConfigurationBuilder::default()
    }

    /// Check values that deserialization alone cannot.
    pub fn validate(&self) -> SecurityResult<()> {
        if self.max_log_entries == 0 {
            return Err(SecurityError::InvalidPolicy(
                "max_log_entries must be at least 1".to_string(),
            ));
        }
        compile_blocklist(&self.blocked_module_patterns)?;
        Ok(())
    }
}

/// Default location of the policy file.
pub fn default_policy_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostguard")
        .join("security.toml")
}

/// On-disk form of the gate's configuration and file access policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub security: SecurityConfiguration,

    #[serde(default, rename = "file_access")]
    pub policies: Vec<FileAccessPolicy>,
}

impl PolicyDocument {
    /// Read and validate a policy file.
    pub fn load(path: &Path) -> SecurityResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let document: Self = toml::from_str(&text).map_err(|e| SecurityError::PolicyFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        document.security.validate()?;
        Ok(document)
    }

    /// Write the policy file, creating parent directories.
    pub fn save(&self, path: &Path) -> SecurityResult<()> {
        let text = toml::to_string_pretty(self).map_err(|e| SecurityError::PolicyFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}
