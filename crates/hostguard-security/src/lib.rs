//! Module trust pipeline and file access control for hostguard.
//!
//! The [`SecurityGate`] is consulted before a native module is trusted and
//! before any file operation a plugin performs. It runs the checks in a fixed
//! order:
//!
//! 1. Signature verification against a sidecar signature block
//! 2. Load-path classification
//! 3. Hijacking detection
//! 4. File access control against priority-ranked [`FileAccessPolicy`] rules
//!
//! Every denial is appended to a bounded event log and folded into
//! [`SecurityStatistics`].

mod config;
mod error;
mod events;
mod gate;
mod hijack;
mod path;
mod permissions;
mod policy;
mod signature;
mod types;

pub use config::{
    PolicyDocument, SecurityConfiguration, SecurityConfigurationBuilder, default_policy_path,
};
pub use error::{SecurityError, SecurityResult};
pub use events::{
    EventFilter, EventLog, SecurityEvent, SecurityEventHandler, SecurityStatistics,
    SecurityThreat,
};
pub use gate::{HandlerId, SecurityGate};
pub use hijack::{KNOWN_SYSTEM_MODULES, detect_hijacking, loaded_modules};
pub use path::{decode_path, is_path_traversal, is_secure_load_path, is_system_directory};
pub use permissions::{Permission, PermissionTable, SecurityContext};
pub use policy::{FileAccessPolicy, FileAccessPolicyBuilder, PolicySet};
pub use signature::{
    DIGEST_ALGORITHM, SignatureInfo, SignaturePolicy, SignatureVerification, SigningRequest,
    digest_file, read_signature, sidecar_path, sign_module, verify_signature,
};
pub use types::{
    AccessDecision, FileAccessType, HijackThreat, SecurityEventType, SecurityStatus,
    SignatureStatus, ThreatLevel,
};
