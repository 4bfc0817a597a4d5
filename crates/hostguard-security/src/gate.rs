//! The security gate.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Duration;
use globset::GlobSet;
use hostguard_core::PluginInfo;
use parking_lot::{Mutex, RwLock};

use crate::config::{PolicyDocument, SecurityConfiguration};
use crate::error::{SecurityError, SecurityResult};
use crate::events::{
    EventFilter, EventLog, SecurityEvent, SecurityEventHandler, SecurityStatistics,
    SecurityThreat, write_json_lines,
};
use crate::hijack::{
    compile_blocklist, detect_hijacking, is_blocked, loaded_module_threat, loaded_modules,
    preload_entries,
};
use crate::path::{is_path_traversal, is_secure_load_path};
use crate::permissions::{Permission, PermissionTable, SecurityContext};
use crate::policy::{FileAccessPolicy, PolicySet};
use crate::signature::{
    SignatureInfo, SignaturePolicy, SignatureVerification, digest_file, read_signature,
    verify_signature,
};
use crate::types::{
    AccessDecision, FileAccessType, HijackThreat, SecurityEventType, SecurityStatus,
    SignatureStatus, ThreatLevel,
};

/// Permission that authorizes loading any plugin while secure mode is on.
const LOAD_ANY_PERMISSION: &str = "plugin.load";

/// Identifies a registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Configuration plus the values compiled from it.
struct GateState {
    config: SecurityConfiguration,
    blocklist: GlobSet,
    revoked: HashSet<String>,
}

impl GateState {
    fn compile(config: SecurityConfiguration) -> SecurityResult<Self> {
        config.validate()?;
        let blocklist = compile_blocklist(&config.blocked_module_patterns)?;
        let revoked = config
            .revoked_thumbprints
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();
        Ok(Self {
            config,
            blocklist,
            revoked,
        })
    }
}

/// Trust pipeline consulted before a module is loaded and before any file
/// operation a plugin performs.
///
/// All methods take `&self`; the gate is shared between the registry and the
/// host behind an `Arc`. No method panics. Boolean checks record a readable
/// reason retrievable through [`SecurityGate::last_error`].
pub struct SecurityGate {
    state: RwLock<GateState>,
    status: RwLock<SecurityStatus>,
    policies: RwLock<PolicySet>,
    log: Mutex<EventLog>,
    permissions: Mutex<PermissionTable>,
    known_digests: RwLock<HashMap<PathBuf, String>>,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn SecurityEventHandler>)>>,
    next_handler: AtomicU64,
    secure_mode: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("status", &*self.status.read())
            .field("policies", &self.policies.read().len())
            .field("secure_mode", &self.secure_mode.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SecurityGate {
    /// Create a gate. It must be initialized before it will vouch for modules.
    pub fn new(config: SecurityConfiguration) -> SecurityResult<Self> {
        let mut log = EventLog::new(config.max_log_entries);
        log.set_retain(config.enable_logging);
        Ok(Self {
            state: RwLock::new(GateState::compile(config)?),
            status: RwLock::new(SecurityStatus::Uninitialized),
            policies: RwLock::new(PolicySet::new()),
            log: Mutex::new(log),
            permissions: Mutex::new(PermissionTable::new()),
            known_digests: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            secure_mode: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }

    // ---- lifecycle ----

    /// Activate the gate and scan the process for suspicious modules.
    ///
    /// With every check switched off the gate settles in `Disabled`. In
    /// secure mode a blocked module already in the process leaves the gate
    /// in `Error`.
    pub fn initialize(&self) -> SecurityResult<()> {
        self.set_status(SecurityStatus::Initializing);

        let (hijack_prevention, enforcing) = {
            let state = self.state.read();
            let config = &state.config;
            (
                config.enable_hijack_prevention,
                config.enable_signature_verification
                    || config.enable_file_access_control
                    || config.enable_hijack_prevention,
            )
        };
        if !enforcing {
            self.set_status(SecurityStatus::Disabled);
            tracing::info!(target: "security", "Security gate disabled by configuration");
            return Ok(());
        }

        if hijack_prevention {
            let suspicious = self.detect_preloaded_modules();
            if let Some(first) = suspicious.first() {
                tracing::warn!(
                    target: "security",
                    count = suspicious.len(),
                    "Suspicious modules present at startup"
                );
                if self.is_secure_mode() {
                    self.set_status(SecurityStatus::Error);
                    return Err(self.reject(SecurityError::BlockedModule {
                        path: first.clone(),
                    }));
                }
            }
        }

        self.set_status(SecurityStatus::Active);
        tracing::info!(target: "security", "Security gate active");
        Ok(())
    }

    /// Deactivate the gate. Policies and the event log are kept.
    pub fn shutdown(&self) {
        self.set_status(SecurityStatus::Uninitialized);
        tracing::info!(target: "security", "Security gate shut down");
    }

    pub fn status(&self) -> SecurityStatus {
        *self.status.read()
    }

    fn set_status(&self, new: SecurityStatus) {
        let old = std::mem::replace(&mut *self.status.write(), new);
        if old != new {
            tracing::debug!(target: "security", %old, %new, "Gate status changed");
            for handler in self.handler_snapshot() {
                handler.on_status_changed(old, new);
            }
        }
    }

    fn ensure_active(&self) -> SecurityResult<()> {
        if matches!(
            self.status(),
            SecurityStatus::Active | SecurityStatus::Disabled
        ) {
            Ok(())
        } else {
            Err(self.reject(SecurityError::NotInitialized))
        }
    }

    /// A copy of the current configuration.
    pub fn configuration(&self) -> SecurityConfiguration {
        self.state.read().config.clone()
    }

    /// Replace the configuration. On error the old one stays in effect.
    pub fn update_configuration(&self, config: SecurityConfiguration) -> SecurityResult<()> {
        let compiled = GateState::compile(config).map_err(|e| self.reject(e))?;
        {
            let mut log = self.log.lock();
            log.set_capacity(compiled.config.max_log_entries);
            log.set_retain(compiled.config.enable_logging);
        }
        *self.state.write() = compiled;
        tracing::info!(target: "security", "Security configuration updated");
        Ok(())
    }

    /// Restore default configuration and drop policies, grants, digests,
    /// events and errors.
    pub fn reset_to_defaults(&self) -> SecurityResult<()> {
        self.update_configuration(SecurityConfiguration::default())?;
        self.policies.write().clear();
        self.permissions.lock().clear();
        self.known_digests.write().clear();
        self.log.lock().clear();
        self.secure_mode.store(false, Ordering::SeqCst);
        self.clear_errors();
        Ok(())
    }

    /// Write the configuration and file access policies to `path`.
    pub fn save_policy(&self, path: &Path) -> SecurityResult<()> {
        let document = PolicyDocument {
            security: self.configuration(),
            policies: self.active_policies(),
        };
        document.save(path).map_err(|e| self.reject(e))
    }

    /// Replace the configuration and file access policies from `path`.
    pub fn load_policy(&self, path: &Path) -> SecurityResult<()> {
        let document = PolicyDocument::load(path).map_err(|e| self.reject(e))?;

        let mut policies = PolicySet::new();
        for policy in document.policies {
            policies.insert(policy).map_err(|e| self.reject(e))?;
        }
        self.update_configuration(document.security)?;
        *self.policies.write() = policies;
        tracing::info!(target: "security", path = %path.display(), "Security policy loaded");
        Ok(())
    }

    // ---- signatures ----

    /// Verify a module against the configured signature policy.
    pub fn verify_signature(&self, path: &Path) -> SignatureVerification {
        let policy = self.state.read().config.signature_policy.clone();
        self.verify_signature_with(path, &policy)
    }

    /// Verify a module against an explicit signature policy.
    pub fn verify_signature_with(
        &self,
        path: &Path,
        policy: &SignaturePolicy,
    ) -> SignatureVerification {
        let revoked = self.state.read().revoked.clone();
        let result = verify_signature(path, policy, &revoked);
        self.log.lock().count_signature_verification();

        let event_type = match result.status {
            SignatureStatus::Valid => None,
            SignatureStatus::NotSigned if !policy.require_valid_signature => None,
            SignatureStatus::Invalid | SignatureStatus::TamperedFile => {
                Some(SecurityEventType::InvalidSignature)
            }
            _ => Some(SecurityEventType::SignatureVerificationFailed),
        };
        if let Some(event_type) = event_type {
            self.set_error(&result.message);
            self.raise(
                SecurityEvent::new(event_type, result.message.clone())
                    .with_context("path", path.display().to_string())
                    .with_context("status", result.status.to_string()),
            );
        }
        result
    }

    /// Parse a module's signature block without checking it.
    pub fn signature_info(&self, path: &Path) -> Option<SignatureInfo> {
        read_signature(path)
    }

    pub fn is_trusted_publisher(&self, publisher: &str) -> bool {
        self.state
            .read()
            .config
            .signature_policy
            .is_trusted_publisher(publisher)
    }

    pub fn is_revoked(&self, thumbprint: &str) -> bool {
        self.state
            .read()
            .revoked
            .contains(&thumbprint.to_ascii_lowercase())
    }

    // ---- file access ----

    /// Whether a plugin may perform `access` on `path`.
    pub fn check_file_access(&self, path: &str, access: FileAccessType) -> bool {
        self.decide_file_access(path, access, None)
    }

    /// As [`check_file_access`](Self::check_file_access), on behalf of a
    /// named requester.
    pub fn check_file_access_as(
        &self,
        path: &str,
        access: FileAccessType,
        requester: &str,
    ) -> bool {
        self.decide_file_access(path, access, Some(requester))
    }

    fn decide_file_access(
        &self,
        path: &str,
        access: FileAccessType,
        requester: Option<&str>,
    ) -> bool {
        self.log.lock().count_file_access_check();

        if path.trim().is_empty() {
            self.set_error("Empty file path");
            self.raise(
                SecurityEvent::new(
                    SecurityEventType::FileAccessDenied,
                    format!("{access} access denied: empty path"),
                )
                .with_context("path", path)
                .with_context("access", access.to_string()),
            );
            return false;
        }

        // Traversal is refused even with access control switched off.
        if is_path_traversal(path) {
            self.set_error(format!("Path traversal attempt: {path}"));
            self.raise(
                SecurityEvent::new(
                    SecurityEventType::PathTraversalAttempt,
                    format!("Path traversal attempt on {path}"),
                )
                .with_context("path", path)
                .with_context("access", access.to_string()),
            );
            return false;
        }

        if !self.state.read().config.enable_file_access_control {
            return true;
        }

        let found = self
            .policies
            .read()
            .find(path)
            .map(|policy| (policy.evaluate(access, requester), policy.pattern.clone()));

        let (decision, pattern) = match found {
            Some((AccessDecision::Audit, pattern)) if self.is_secure_mode() => {
                (AccessDecision::AuditAndDeny, Some(pattern))
            }
            Some((decision, pattern)) => (decision, Some(pattern)),
            None => (AccessDecision::Deny, None),
        };

        if decision.permits() {
            if decision.is_audited() {
                tracing::info!(
                    target: "security",
                    path,
                    %access,
                    requester = requester.unwrap_or("-"),
                    "Audited file access"
                );
            }
            return true;
        }

        let reason = match &pattern {
            Some(pattern) => format!("{access} access to {path} denied by policy '{pattern}'"),
            None => format!("{access} access to {path} denied: no matching policy"),
        };
        self.set_error(&reason);
        let mut event = SecurityEvent::new(SecurityEventType::FileAccessDenied, reason)
            .with_context("path", path)
            .with_context("access", access.to_string());
        if let Some(pattern) = pattern {
            event = event.with_context("policy", pattern);
        }
        if let Some(requester) = requester {
            event = event.with_context("requester", requester);
        }
        self.raise(event);
        false
    }

    /// Add or replace the policy for its pattern.
    pub fn set_file_access_policy(&self, policy: FileAccessPolicy) -> SecurityResult<()> {
        let pattern = policy.pattern.clone();
        self.policies
            .write()
            .insert(policy)
            .map_err(|e| self.reject(e))?;
        tracing::debug!(target: "security", %pattern, "File access policy set");
        Ok(())
    }

    /// Remove the policy for `pattern`. Returns whether one existed.
    pub fn remove_file_access_policy(&self, pattern: &str) -> bool {
        self.policies.write().remove(pattern)
    }

    /// Policies in registration order.
    pub fn active_policies(&self) -> Vec<FileAccessPolicy> {
        self.policies.read().policies().cloned().collect()
    }

    /// Whether `path` is acceptable as a file path at all.
    pub fn validate_file_path(&self, path: &str) -> bool {
        if path.trim().is_empty() {
            self.set_error("Empty file path");
            return false;
        }
        if is_path_traversal(path) {
            self.set_error(format!("Path traversal attempt: {path}"));
            return false;
        }
        if path.chars().any(|c| c.is_control()) {
            self.set_error(format!("Control character in path: {}", path.escape_debug()));
            return false;
        }
        true
    }

    pub fn is_path_traversal(&self, path: &str) -> bool {
        is_path_traversal(path)
    }

    // ---- module trust ----

    /// Whether `path` is in a directory modules may be loaded from.
    pub fn is_secure_load_path(&self, path: &Path) -> bool {
        is_secure_load_path(path, &self.state.read().config.trusted_directories)
    }

    /// Load-path and hijacking checks, recording any finding.
    pub fn validate_load_path(&self, path: &Path) -> bool {
        self.detect_hijacking(path, None).is_none() && self.check_load_location(path)
    }

    fn check_load_location(&self, path: &Path) -> bool {
        if self.is_secure_load_path(path) {
            return true;
        }
        let message = format!("Insecure load path: {}", path.display());
        self.set_error(&message);
        self.raise(
            SecurityEvent::new(SecurityEventType::PluginLoadDenied, message)
                .with_context("path", path.display().to_string()),
        );
        false
    }

    /// Check whether `path` looks like a substitute for a trusted module.
    pub fn detect_hijacking(&self, path: &Path, expected: Option<&Path>) -> Option<HijackThreat> {
        let threat = detect_hijacking(path, expected)?;
        let message = format!("Possible {threat}: {}", path.display());
        self.set_error(&message);
        let mut event = SecurityEvent::new(SecurityEventType::HijackingAttempt, message)
            .with_context("path", path.display().to_string())
            .with_context("threat", threat.to_string());
        if let Some(expected) = expected {
            event = event.with_context("expected", expected.display().to_string());
        }
        self.raise(event);
        Some(threat)
    }

    /// Scan the modules mapped into this process against the blocklist.
    pub fn detect_preloaded_modules(&self) -> Vec<PathBuf> {
        self.scan_modules(&loaded_modules())
    }

    /// Report which of `modules` match the blocklist.
    pub fn scan_modules(&self, modules: &[PathBuf]) -> Vec<PathBuf> {
        let suspicious: Vec<PathBuf> = {
            let state = self.state.read();
            modules
                .iter()
                .filter(|m| is_blocked(m, &state.blocklist))
                .cloned()
                .collect()
        };
        let injected = preload_entries();
        for module in &suspicious {
            self.raise(
                SecurityEvent::new(
                    SecurityEventType::SuspiciousPreloadedModule,
                    format!("Blocked module present in process: {}", module.display()),
                )
                .with_context("path", module.display().to_string())
                .with_context("threat", loaded_module_threat(module, &injected).to_string()),
            );
        }
        suspicious
    }

    pub fn is_blacklisted_module(&self, path: &Path) -> bool {
        is_blocked(path, &self.state.read().blocklist)
    }

    /// Record the expected digest of a module.
    pub fn register_known_digest(&self, path: impl Into<PathBuf>, digest: impl Into<String>) {
        self.known_digests.write().insert(path.into(), digest.into());
    }

    /// Compare a module's digest with its registered digest, or with the
    /// digest in its signature block when none is registered.
    pub fn check_module_integrity(&self, path: &Path) -> bool {
        let actual = match digest_file(path) {
            Ok(digest) => digest,
            Err(e) => {
                self.set_error(format!("Cannot read {}: {e}", path.display()));
                return false;
            }
        };

        let expected = self
            .known_digests
            .read()
            .get(path)
            .cloned()
            .or_else(|| read_signature(path).map(|info| info.digest));

        match expected {
            None => {
                self.set_error(format!("No reference digest for {}", path.display()));
                false
            }
            Some(expected) if expected.eq_ignore_ascii_case(&actual) => true,
            Some(_) => {
                let message = format!("Module contents changed: {}", path.display());
                self.set_error(&message);
                self.raise(
                    SecurityEvent::new(SecurityEventType::SystemIntegrityViolation, message)
                        .with_context("path", path.display().to_string()),
                );
                false
            }
        }
    }

    /// Checks that run before a module is opened: traversal, blocklist,
    /// hijacking and load path.
    pub fn check_module_path(&self, path: &Path) -> SecurityResult<()> {
        self.ensure_active()?;

        let text = path.to_string_lossy();
        if is_path_traversal(&text) {
            self.raise(
                SecurityEvent::new(
                    SecurityEventType::PathTraversalAttempt,
                    format!("Module path traversal: {text}"),
                )
                .with_context("path", text.to_string()),
            );
            return Err(self.reject(SecurityError::PathTraversal {
                path: text.into_owned(),
            }));
        }

        if !self.state.read().config.enable_hijack_prevention {
            return Ok(());
        }

        if self.is_blacklisted_module(path) {
            self.raise(
                SecurityEvent::new(
                    SecurityEventType::PluginLoadDenied,
                    format!("Blocked module name: {}", path.display()),
                )
                .with_context("path", path.display().to_string()),
            );
            return Err(self.reject(SecurityError::BlockedModule {
                path: path.to_path_buf(),
            }));
        }

        if let Some(threat) = self.detect_hijacking(path, None) {
            return Err(self.reject(SecurityError::Hijacking {
                path: path.to_path_buf(),
                threat,
            }));
        }

        if !self.check_load_location(path) {
            return Err(self.reject(SecurityError::InsecureLoadPath {
                path: path.to_path_buf(),
            }));
        }
        Ok(())
    }

    /// Signature check for a module about to be trusted.
    ///
    /// Returns `None` when signature verification is disabled. An unsigned
    /// module passes only if the policy does not require a signature and
    /// secure mode is off.
    pub fn verify_module(&self, path: &Path) -> SecurityResult<Option<SignatureVerification>> {
        self.ensure_active()?;

        let (enabled, policy) = {
            let state = self.state.read();
            (
                state.config.enable_signature_verification,
                state.config.signature_policy.clone(),
            )
        };
        if !enabled {
            return Ok(None);
        }

        let result = self.verify_signature_with(path, &policy);
        match result.status {
            SignatureStatus::Valid => Ok(Some(result)),
            SignatureStatus::NotSigned
                if !policy.require_valid_signature && !self.is_secure_mode() =>
            {
                tracing::debug!(target: "security", path = %path.display(), "Unsigned module accepted");
                Ok(Some(result))
            }
            status => Err(self.reject(SecurityError::Signature {
                path: path.to_path_buf(),
                status,
                message: result.message,
            })),
        }
    }

    /// Run the whole module pipeline without opening the module.
    pub fn validate_plugin(&self, path: &Path) -> SecurityResult<Option<SignatureVerification>> {
        if !path.is_file() {
            return Err(self.reject(SecurityError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ))));
        }
        self.check_module_path(path)?;
        self.verify_module(path)
    }

    /// Decide whether a plugin that passed the module pipeline may load.
    ///
    /// In secure mode the requester must hold `plugin.load` or
    /// `plugin.load:<name>`.
    pub fn authorize_plugin_load(
        &self,
        info: &PluginInfo,
        context: &SecurityContext,
    ) -> SecurityResult<()> {
        let denial = if info.name.trim().is_empty() {
            Some("Plugin reports an empty name".to_string())
        } else if is_blocked(Path::new(&info.name), &self.state.read().blocklist) {
            Some("Plugin name matches a blocked pattern".to_string())
        } else if self.is_secure_mode()
            && !self.check_permission(LOAD_ANY_PERMISSION, context)
            && !self.check_permission(&format!("{LOAD_ANY_PERMISSION}:{}", info.name), context)
        {
            Some(format!(
                "Secure mode requires a load permission for '{}'",
                context.requester
            ))
        } else {
            None
        };

        match denial {
            None => Ok(()),
            Some(message) => {
                self.raise(
                    SecurityEvent::new(SecurityEventType::PluginLoadDenied, message.clone())
                        .with_context("plugin", info.name.clone())
                        .with_context("requester", context.requester.clone()),
                );
                Err(self.reject(SecurityError::Unauthorized {
                    name: info.name.clone(),
                    message,
                }))
            }
        }
    }

    /// Run the module pipeline, then open the module with `open`.
    pub fn secure_open<T, E>(
        &self,
        path: &Path,
        open: impl FnOnce(&Path) -> Result<T, E>,
    ) -> SecurityResult<T>
    where
        E: std::fmt::Display,
    {
        self.validate_plugin(path)?;
        open(path).map_err(|e| {
            self.reject(SecurityError::OpenFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        })
    }

    // ---- permissions ----

    pub fn grant_permission(
        &self,
        operation: &str,
        context: &SecurityContext,
        ttl: Option<Duration>,
    ) -> SecurityResult<Permission> {
        let permission = self
            .permissions
            .lock()
            .grant(operation, context, ttl)
            .map_err(|e| self.reject(e))?;
        tracing::debug!(
            target: "security",
            operation,
            requester = %context.requester,
            "Permission granted"
        );
        Ok(permission)
    }

    pub fn revoke_permission(&self, operation: &str, context: &SecurityContext) -> bool {
        self.permissions.lock().revoke(operation, context)
    }

    pub fn check_permission(&self, operation: &str, context: &SecurityContext) -> bool {
        self.permissions.lock().check(operation, context)
    }

    pub fn granted_permissions(&self, context: &SecurityContext) -> Vec<Permission> {
        self.permissions.lock().granted(context)
    }

    // ---- secure mode and threats ----

    pub fn is_secure_mode(&self) -> bool {
        self.secure_mode.load(Ordering::SeqCst)
    }

    /// In secure mode unsigned modules are refused, audit-only policy
    /// decisions deny, and loads need an explicit permission.
    pub fn set_secure_mode(&self, enabled: bool) {
        self.secure_mode.store(enabled, Ordering::SeqCst);
        tracing::info!(target: "security", enabled, "Secure mode changed");
    }

    pub fn has_active_threats(&self) -> bool {
        self.log.lock().statistics().active_threats > 0
    }

    pub fn active_threats(&self) -> Vec<SecurityThreat> {
        self.log.lock().active_threats()
    }

    pub fn resolve_threat(&self, id: &str) -> bool {
        self.log.lock().resolve_threat(id)
    }

    // ---- events ----

    /// Append an event, update statistics, and notify handlers.
    pub fn log_event(&self, event: SecurityEvent) {
        self.raise(event);
    }

    fn raise(&self, event: SecurityEvent) {
        if event.threat_level >= ThreatLevel::High {
            tracing::error!(
                target: "security",
                event_type = %event.event_type,
                level = %event.threat_level,
                "{}",
                event.description
            );
        } else {
            tracing::warn!(
                target: "security",
                event_type = %event.event_type,
                level = %event.threat_level,
                "{}",
                event.description
            );
        }

        let threat = self.log.lock().record(event.clone());
        for handler in self.handler_snapshot() {
            handler.on_event(&event);
            if let Some(threat) = &threat {
                handler.on_threat(threat);
            }
        }
    }

    /// At most `n` events, most recent first.
    pub fn recent_events(&self, n: usize) -> Vec<SecurityEvent> {
        self.log.lock().recent(n)
    }

    /// Events matching `filter`, oldest first.
    pub fn filtered_events(&self, filter: &EventFilter) -> Vec<SecurityEvent> {
        self.log.lock().filtered(filter)
    }

    pub fn statistics(&self) -> SecurityStatistics {
        self.log.lock().statistics()
    }

    /// Write events matching `filter` to `path` as JSON lines.
    pub fn export_log(&self, path: &Path, filter: &EventFilter) -> SecurityResult<usize> {
        let events = self.filtered_events(filter);
        let file = File::create(path).map_err(|e| self.reject(e.into()))?;
        let written = write_json_lines(BufWriter::new(file), &events)
            .map_err(|e| self.reject(e.into()))?;
        tracing::info!(target: "security", path = %path.display(), written, "Security log exported");
        Ok(written)
    }

    pub fn register_event_handler(&self, handler: Arc<dyn SecurityEventHandler>) -> HandlerId {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub fn unregister_event_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    fn handler_snapshot(&self) -> Vec<Arc<dyn SecurityEventHandler>> {
        self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    // ---- errors ----

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        self.last_error.lock().is_some()
    }

    pub fn clear_errors(&self) {
        *self.last_error.lock() = None;
    }

    fn set_error(&self, message: impl AsRef<str>) {
        *self.last_error.lock() = Some(message.as_ref().to_string());
    }

    fn reject(&self, err: SecurityError) -> SecurityError {
        self.set_error(err.to_string());
        err
    }
}
