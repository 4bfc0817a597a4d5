//! Enumerations shared across the security pipeline.

use serde::{Deserialize, Serialize};

/// Outcome of verifying a module's signature block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum SignatureStatus {
    Valid,
    Invalid,
    NotSigned,
    ExpiredCertificate,
    RevokedCertificate,
    UntrustedPublisher,
    TamperedFile,
    VerificationFailed,
}

/// Kind of file operation being requested.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum FileAccessType {
    Read,
    Write,
    Execute,
    Delete,
    Create,
    Modify,
    ListDirectory,
    ChangePermissions,
}

/// Decision a file access policy reaches.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum AccessDecision {
    Allow,
    Deny,
    /// Allow, recording the access.
    Audit,
    AuditAndAllow,
    AuditAndDeny,
}

impl AccessDecision {
    /// Whether the decision lets the operation proceed.
    pub fn permits(self) -> bool {
        matches!(self, Self::Allow | Self::Audit | Self::AuditAndAllow)
    }

    /// Whether the decision asks for the access to be recorded.
    pub fn is_audited(self) -> bool {
        matches!(self, Self::Audit | Self::AuditAndAllow | Self::AuditAndDeny)
    }
}

/// Category of a recorded security event.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum SecurityEventType {
    SignatureVerificationFailed,
    FileAccessDenied,
    HijackingAttempt,
    SuspiciousPreloadedModule,
    PluginLoadDenied,
    InvalidSignature,
    PathTraversalAttempt,
    SandboxViolation,
    SecurityPolicyViolation,
    SystemIntegrityViolation,
}

impl SecurityEventType {
    /// Threat level assigned when the caller does not choose one.
    pub fn default_threat_level(self) -> ThreatLevel {
        match self {
            Self::FileAccessDenied => ThreatLevel::Low,
            Self::SignatureVerificationFailed
            | Self::PluginLoadDenied
            | Self::SandboxViolation
            | Self::SecurityPolicyViolation => ThreatLevel::Medium,
            Self::SuspiciousPreloadedModule
            | Self::InvalidSignature
            | Self::PathTraversalAttempt => ThreatLevel::High,
            Self::HijackingAttempt | Self::SystemIntegrityViolation => ThreatLevel::Critical,
        }
    }

    /// Whether events of this type count as a blocked operation.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::FileAccessDenied | Self::PathTraversalAttempt | Self::PluginLoadDenied
        )
    }
}

/// Lifecycle of the security gate itself.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
pub enum SecurityStatus {
    #[default]
    Uninitialized,
    Initializing,
    Active,
    Error,
    Disabled,
}

/// Severity attached to events and threats.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// Way in which a module may have been substituted for a trusted one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum HijackThreat {
    /// A system module name resolved outside the system directories.
    SearchPathHijacking,
    /// The module was found somewhere other than where it was expected.
    ModulePlanting,
    /// A blocked module is already mapped into the process.
    ModulePreloading,
    /// A module was injected through the preload environment.
    ModuleInjection,
    /// A system module name resolved from an application-local redirection.
    SideBySideHijacking,
}
