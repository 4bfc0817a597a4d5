//! Error types for the security gate.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{FileAccessType, HijackThreat, SignatureStatus};

/// Result type for security operations.
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Errors raised by the security gate.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The gate has not been initialized.
    #[error("Security gate not initialized")]
    NotInitialized,

    /// A path contains a traversal sequence.
    #[error("Path traversal attempt: {path}")]
    PathTraversal { path: String },

    /// A module lives in a directory that is not trusted for loading.
    #[error("Insecure load path: {path}")]
    InsecureLoadPath { path: PathBuf },

    /// A module looks like a substitute for a trusted one.
    #[error("Possible module hijacking ({threat}): {path}")]
    Hijacking { path: PathBuf, threat: HijackThreat },

    /// A module name matches a blocked pattern.
    #[error("Blocked module: {path}")]
    BlockedModule { path: PathBuf },

    /// The module's signature did not verify.
    #[error("Signature check failed for {path} ({status}): {message}")]
    Signature {
        path: PathBuf,
        status: SignatureStatus,
        message: String,
    },

    /// The module contents do not match the reference digest.
    #[error("Integrity check failed for {path}: {message}")]
    Integrity { path: PathBuf, message: String },

    /// A file operation was refused.
    #[error("{access} access denied: {path}")]
    AccessDenied { path: String, access: FileAccessType },

    /// The plugin is not authorized to load.
    #[error("Plugin '{name}' is not authorized to load: {message}")]
    Unauthorized { name: String, message: String },

    /// A policy or configuration value is invalid.
    #[error("Invalid security policy: {0}")]
    InvalidPolicy(String),

    /// The module passed every check but could not be opened.
    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: PathBuf, message: String },

    /// The policy file could not be parsed or rendered.
    #[error("Policy file {path}: {message}")]
    PolicyFile { path: PathBuf, message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
