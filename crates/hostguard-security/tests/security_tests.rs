//! Integration tests for hostguard-security.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hostguard_core::PluginInfo;
use hostguard_security::{
    AccessDecision, EventFilter, FileAccessPolicy, FileAccessType, HijackThreat, SecurityConfiguration,
    SecurityContext, SecurityError, SecurityEvent, SecurityEventHandler, SecurityEventType,
    SecurityGate, SecurityStatus, SecurityThreat, SignaturePolicy, SignatureStatus,
    SigningRequest, ThreatLevel, sign_module,
};
use tempfile::TempDir;

fn active_gate(config: SecurityConfiguration) -> SecurityGate {
    let gate = SecurityGate::new(config).unwrap();
    gate.initialize().unwrap();
    gate
}

fn policy(pattern: &str, priority: u32, allowed: &[FileAccessType]) -> FileAccessPolicy {
    FileAccessPolicy::builder()
        .pattern(pattern)
        .priority(priority)
        .allowed(allowed.iter().copied().collect::<std::collections::BTreeSet<_>>())
        .build()
        .unwrap()
}

/// A module file in a trusted temporary directory.
fn module_fixture(name: &str) -> (TempDir, PathBuf, SecurityConfiguration) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, b"module image").unwrap();
    let config = SecurityConfiguration::builder()
        .trusted_directories(vec![dir.path().to_path_buf()])
        .signature_policy(SignaturePolicy::default().trust_publisher("Example Corp"))
        .build()
        .unwrap();
    (dir, path, config)
}

fn sign(path: &Path) {
    sign_module(
        path,
        &SigningRequest::new("Example Corp").issuer("Example Root CA"),
    )
    .unwrap();
}

#[test]
fn test_traversal_denied_under_every_configuration() {
    let configs = [
        SecurityConfiguration::default(),
        SecurityConfiguration::builder()
            .enable_file_access_control(false)
            .build()
            .unwrap(),
        SecurityConfiguration::builder()
            .enable_hijack_prevention(false)
            .enable_signature_verification(false)
            .enable_logging(false)
            .build()
            .unwrap(),
    ];

    for config in configs {
        let gate = active_gate(config);
        gate.set_file_access_policy(policy("**", 1000, &[FileAccessType::Read]))
            .unwrap();
        assert!(!gate.check_file_access("../../etc/passwd", FileAccessType::Read));
        assert!(!gate.check_file_access("%2e%2e/%2e%2e/etc/passwd", FileAccessType::Read));
        assert!(!gate.check_file_access_as(
            r"..\..\Windows\win.ini",
            FileAccessType::Read,
            "test_application"
        ));
    }
}

#[test]
fn test_pattern_policies() {
    let gate = active_gate(SecurityConfiguration::default());
    gate.set_file_access_policy(policy("*.txt", 10, &[FileAccessType::Read]))
        .unwrap();
    gate.set_file_access_policy(policy(
        "temp/*",
        10,
        &[FileAccessType::Read, FileAccessType::Write, FileAccessType::Delete],
    ))
    .unwrap();
    gate.set_file_access_policy(policy("**/*.log", 10, &[FileAccessType::Write]))
        .unwrap();

    assert!(gate.check_file_access("notes.txt", FileAccessType::Read));
    assert!(!gate.check_file_access("notes.txt", FileAccessType::Write));
    assert!(gate.check_file_access("temp/cache.bin", FileAccessType::Delete));
    assert!(gate.check_file_access("var/log/app.log", FileAccessType::Write));
    assert!(!gate.check_file_access("image.png", FileAccessType::Read));
    assert_eq!(gate.active_policies().len(), 3);
}

#[test]
fn test_higher_priority_wins_regardless_of_order() {
    for reversed in [false, true] {
        let gate = active_gate(SecurityConfiguration::default());
        let low = FileAccessPolicy::builder()
            .pattern("data/*.bin")
            .priority(10u32)
            .allowed([FileAccessType::Read])
            .build()
            .unwrap();
        let high = FileAccessPolicy::builder()
            .pattern("data/*")
            .priority(100u32)
            .denied([FileAccessType::Read])
            .build()
            .unwrap();

        let order = if reversed { [high, low] } else { [low, high] };
        for p in order {
            gate.set_file_access_policy(p).unwrap();
        }
        assert!(!gate.check_file_access("data/blob.bin", FileAccessType::Read));
    }
}

#[test]
fn test_requester_context() {
    let gate = active_gate(SecurityConfiguration::default());
    gate.set_file_access_policy(
        FileAccessPolicy::builder()
            .pattern("secure/*")
            .allowed([FileAccessType::Read])
            .trusted_requesters(vec!["test_application".to_string()])
            .build()
            .unwrap(),
    )
    .unwrap();

    assert!(gate.check_file_access_as("secure/data.bin", FileAccessType::Read, "test_application"));
    assert!(!gate.check_file_access_as(
        "secure/data.bin",
        FileAccessType::Read,
        "malicious_application"
    ));
    let last = &gate.recent_events(1)[0];
    assert_eq!(last.event_type, SecurityEventType::FileAccessDenied);
    assert_eq!(last.context["requester"], "malicious_application");
}

#[test]
fn test_access_control_disabled_allows_non_traversal() {
    let config = SecurityConfiguration::builder()
        .enable_file_access_control(false)
        .build()
        .unwrap();
    let gate = active_gate(config);
    assert!(gate.check_file_access("anything/at/all.bin", FileAccessType::Write));
}

#[test]
fn test_remove_policy() {
    let gate = active_gate(SecurityConfiguration::default());
    gate.set_file_access_policy(policy("*.txt", 0, &[FileAccessType::Read]))
        .unwrap();
    assert!(gate.check_file_access("a.txt", FileAccessType::Read));
    assert!(gate.remove_file_access_policy("*.txt"));
    assert!(!gate.remove_file_access_policy("*.txt"));
    assert!(!gate.check_file_access("a.txt", FileAccessType::Read));
}

#[test]
fn test_default_decision_variants() {
    let gate = active_gate(SecurityConfiguration::default());
    gate.set_file_access_policy(
        FileAccessPolicy::builder()
            .pattern("audit/*")
            .default_decision(AccessDecision::AuditAndAllow)
            .build()
            .unwrap(),
    )
    .unwrap();
    gate.set_file_access_policy(
        FileAccessPolicy::builder()
            .pattern("locked/*")
            .default_decision(AccessDecision::AuditAndDeny)
            .build()
            .unwrap(),
    )
    .unwrap();

    assert!(gate.check_file_access("audit/x", FileAccessType::Modify));
    assert!(!gate.check_file_access("locked/x", FileAccessType::Modify));
}

#[test]
fn test_signature_through_gate() {
    let (_dir, path, config) = module_fixture("viewer.so");
    let gate = active_gate(config);

    let unsigned = gate.verify_signature(&path);
    assert_eq!(unsigned.status, SignatureStatus::NotSigned);
    let permissive = gate.verify_signature_with(&path, &SignaturePolicy::permissive());
    assert_eq!(permissive.status, SignatureStatus::NotSigned);

    sign(&path);
    let signed = gate.verify_signature(&path);
    assert!(signed.is_valid(), "{}", signed.message);
    assert_eq!(signed.info.as_ref().unwrap().subject, "Example Corp");
    assert!(gate.is_trusted_publisher("example corp"));
    assert!(gate.statistics().signature_verifications >= 3);
    assert!(gate.signature_info(&path).is_some());
}

#[test]
fn test_revoked_thumbprint_from_configuration() {
    let (_dir, path, config) = module_fixture("viewer.so");
    sign(&path);
    let thumbprint = hostguard_security::read_signature(&path).unwrap().thumbprint;

    let mut config = config;
    config.revoked_thumbprints = vec![thumbprint.to_uppercase()];
    let gate = active_gate(config);

    assert!(gate.is_revoked(&thumbprint));
    assert_eq!(
        gate.verify_signature(&path).status,
        SignatureStatus::RevokedCertificate
    );
}

#[test]
fn test_module_pipeline() {
    let (_dir, path, config) = module_fixture("viewer.so");
    let gate = active_gate(config);

    gate.check_module_path(&path).unwrap();
    let err = gate.verify_module(&path).unwrap_err();
    assert!(matches!(
        err,
        SecurityError::Signature {
            status: SignatureStatus::NotSigned,
            ..
        }
    ));

    sign(&path);
    let verification = gate.validate_plugin(&path).unwrap().unwrap();
    assert!(verification.is_valid());

    std::fs::write(&path, b"patched").unwrap();
    let err = gate.validate_plugin(&path).unwrap_err();
    assert!(matches!(
        err,
        SecurityError::Signature {
            status: SignatureStatus::TamperedFile,
            ..
        }
    ));
    assert!(gate.last_error().unwrap().contains("TamperedFile"));
}

#[test]
fn test_unsigned_allowed_when_not_required() {
    let (_dir, path, mut config) = module_fixture("viewer.so");
    config.signature_policy.require_valid_signature = false;
    let gate = active_gate(config);

    let result = gate.verify_module(&path).unwrap().unwrap();
    assert_eq!(result.status, SignatureStatus::NotSigned);

    gate.set_secure_mode(true);
    assert!(gate.verify_module(&path).is_err());
}

#[test]
fn test_module_path_rejections() {
    let (dir, _path, config) = module_fixture("viewer.so");
    let gate = active_gate(config);

    let hooked = dir.path().join("libkeyhook.so");
    std::fs::write(&hooked, b"x").unwrap();
    assert!(matches!(
        gate.check_module_path(&hooked),
        Err(SecurityError::BlockedModule { .. })
    ));

    let planted = dir.path().join("kernel32.dll");
    std::fs::write(&planted, b"x").unwrap();
    assert!(matches!(
        gate.check_module_path(&planted),
        Err(SecurityError::Hijacking {
            threat: HijackThreat::SearchPathHijacking,
            ..
        })
    ));

    assert!(matches!(
        gate.check_module_path(Path::new("/home/someone/viewer.so")),
        Err(SecurityError::InsecureLoadPath { .. })
    ));
    assert!(matches!(
        gate.check_module_path(Path::new("plugins/../../evil.so")),
        Err(SecurityError::PathTraversal { .. })
    ));
    assert!(gate.statistics().hijacking_attempts >= 1);
    assert!(gate.has_active_threats());
}

#[test]
fn test_load_path_classification() {
    let gate = active_gate(SecurityConfiguration::default());
    assert!(gate.is_secure_load_path(Path::new(r"C:\Windows\System32\plugin.dll")));
    assert!(gate.is_secure_load_path(Path::new(r"C:\Windows\SysWOW64\plugin.dll")));
    assert!(gate.is_secure_load_path(Path::new(r"C:\Program Files\App\plugin.dll")));
    assert!(!gate.is_secure_load_path(Path::new(r"C:\Temp\plugin.dll")));
    assert!(!gate.is_secure_load_path(Path::new(r"C:\Users\Public\plugin.dll")));
    assert!(!gate.is_secure_load_path(Path::new(r"C:\Windows\Temp\plugin.dll")));

    assert!(!gate.validate_load_path(Path::new(r"C:\Temp\plugin.dll")));
    assert_eq!(
        gate.recent_events(1)[0].event_type,
        SecurityEventType::PluginLoadDenied
    );
}

#[test]
fn test_hijack_detection_records_events() {
    let gate = active_gate(SecurityConfiguration::default());
    for name in ["kernel32.dll", "user32.dll", "advapi32.dll", "msvcrt.dll"] {
        let path = PathBuf::from(format!(r"C:\Users\me\App\{name}"));
        assert_eq!(
            gate.detect_hijacking(&path, None),
            Some(HijackThreat::SearchPathHijacking)
        );
        let genuine = PathBuf::from(format!(r"C:\Windows\System32\{name}"));
        assert_eq!(gate.detect_hijacking(&genuine, None), None);
    }

    let hijacks = gate.filtered_events(
        &EventFilter::new().event_type(SecurityEventType::HijackingAttempt),
    );
    assert_eq!(hijacks.len(), 4);
    assert!(hijacks.iter().all(|e| e.threat_level == ThreatLevel::Critical));
}

#[test]
fn test_preloaded_scan() {
    let gate = active_gate(SecurityConfiguration::default());
    let modules = vec![
        PathBuf::from("/usr/lib/libc.so.6"),
        PathBuf::from("/tmp/libinject.so"),
        PathBuf::from("/home/me/KeyLogger.so"),
    ];
    let suspicious = gate.scan_modules(&modules);
    assert_eq!(suspicious.len(), 2);
    assert!(gate.is_blacklisted_module(Path::new("/tmp/libinject.so")));
    assert!(!gate.is_blacklisted_module(Path::new("/usr/lib/libc.so.6")));
}

#[test]
fn test_module_integrity() {
    let (_dir, path, config) = module_fixture("viewer.so");
    let gate = active_gate(config);

    assert!(!gate.check_module_integrity(&path));
    assert!(gate.last_error().unwrap().contains("No reference digest"));

    let digest = hostguard_security::digest_file(&path).unwrap();
    gate.register_known_digest(&path, digest);
    assert!(gate.check_module_integrity(&path));

    std::fs::write(&path, b"changed").unwrap();
    assert!(!gate.check_module_integrity(&path));
    assert_eq!(
        gate.recent_events(1)[0].event_type,
        SecurityEventType::SystemIntegrityViolation
    );
}

#[test]
fn test_secure_open() {
    let (_dir, path, config) = module_fixture("viewer.so");
    sign(&path);
    let gate = active_gate(config);

    let opened = gate
        .secure_open(&path, |p| std::fs::read(p))
        .unwrap();
    assert_eq!(opened, b"module image");

    let err = gate
        .secure_open(&path, |_| Err::<(), _>("loader refused"))
        .unwrap_err();
    assert!(matches!(err, SecurityError::OpenFailed { .. }));
}

#[test]
fn test_authorize_plugin_load() {
    let gate = active_gate(SecurityConfiguration::default());
    let host = SecurityContext::new("host").with_user("admin");
    let info = PluginInfo::new("viewer", "1.0.0");

    gate.authorize_plugin_load(&info, &host).unwrap();
    assert!(gate
        .authorize_plugin_load(&PluginInfo::new("", "1.0.0"), &host)
        .is_err());
    assert!(gate
        .authorize_plugin_load(&PluginInfo::new("sneaky_hook", "1.0.0"), &host)
        .is_err());

    gate.set_secure_mode(true);
    assert!(matches!(
        gate.authorize_plugin_load(&info, &host),
        Err(SecurityError::Unauthorized { .. })
    ));
    gate.grant_permission("plugin.load:viewer", &host, None).unwrap();
    gate.authorize_plugin_load(&info, &host).unwrap();
}

#[test]
fn test_permissions() {
    let gate = active_gate(SecurityConfiguration::default());
    let ctx = SecurityContext::new("viewer").with_user("admin");

    assert!(!gate.check_permission("file.write", &ctx));
    let granted = gate.grant_permission("file.write", &ctx, None).unwrap();
    assert_eq!(granted.granted_by, "admin");
    assert!(gate.check_permission("file.write", &ctx));
    assert_eq!(gate.granted_permissions(&ctx).len(), 1);

    assert!(gate.revoke_permission("file.write", &ctx));
    assert!(!gate.check_permission("file.write", &ctx));
    assert!(gate.grant_permission("", &ctx, None).is_err());
}

#[test]
fn test_recent_events_newest_first() {
    let gate = active_gate(SecurityConfiguration::default());
    gate.log_event(SecurityEvent::new(SecurityEventType::SandboxViolation, "first"));
    gate.log_event(SecurityEvent::new(SecurityEventType::SandboxViolation, "second"));
    gate.log_event(SecurityEvent::new(SecurityEventType::SandboxViolation, "third"));

    let recent = gate.recent_events(2);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].description, "third");
    assert_eq!(recent[1].description, "second");
}

#[test]
fn test_log_is_bounded() {
    let config = SecurityConfiguration::builder()
        .max_log_entries(5usize)
        .build()
        .unwrap();
    let gate = active_gate(config);
    for i in 0..20 {
        gate.log_event(SecurityEvent::new(
            SecurityEventType::SandboxViolation,
            format!("event {i}"),
        ));
    }
    assert_eq!(gate.recent_events(100).len(), 5);
    assert_eq!(gate.recent_events(1)[0].description, "event 19");
}

#[derive(Default)]
struct CountingHandler {
    events: AtomicUsize,
    threats: AtomicUsize,
    status_changes: AtomicUsize,
}

impl SecurityEventHandler for CountingHandler {
    fn on_event(&self, _event: &SecurityEvent) {
        self.events.fetch_add(1, Ordering::SeqCst);
    }

    fn on_threat(&self, _threat: &SecurityThreat) {
        self.threats.fetch_add(1, Ordering::SeqCst);
    }

    fn on_status_changed(&self, _old: SecurityStatus, _new: SecurityStatus) {
        self.status_changes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_event_handlers() {
    let gate = SecurityGate::new(
        SecurityConfiguration::builder()
            .enable_hijack_prevention(false)
            .build()
            .unwrap(),
    )
    .unwrap();
    let handler = Arc::new(CountingHandler::default());
    let id = gate.register_event_handler(handler.clone());

    gate.initialize().unwrap();
    assert_eq!(handler.status_changes.load(Ordering::SeqCst), 2);

    gate.check_file_access("../secret", FileAccessType::Read);
    assert_eq!(handler.events.load(Ordering::SeqCst), 1);
    assert_eq!(handler.threats.load(Ordering::SeqCst), 1);

    assert!(gate.unregister_event_handler(id));
    assert!(!gate.unregister_event_handler(id));
    gate.check_file_access("../secret", FileAccessType::Read);
    assert_eq!(handler.events.load(Ordering::SeqCst), 1);
}

#[test]
fn test_threat_resolution() {
    let gate = active_gate(
        SecurityConfiguration::builder()
            .enable_hijack_prevention(false)
            .build()
            .unwrap(),
    );
    gate.detect_hijacking(Path::new("/home/me/libc.so.6"), None);
    let threats = gate.active_threats();
    assert_eq!(threats.len(), 1);

    assert!(gate.resolve_threat(&threats[0].id));
    assert!(!gate.has_active_threats());
}

#[test]
fn test_export_log() {
    let dir = tempfile::tempdir().unwrap();
    let gate = active_gate(SecurityConfiguration::default());
    gate.check_file_access("../a", FileAccessType::Read);
    gate.check_file_access("b.txt", FileAccessType::Read);

    let out = dir.path().join("events.jsonl");
    let written = gate
        .export_log(
            &out,
            &EventFilter::new().event_type(SecurityEventType::FileAccessDenied),
        )
        .unwrap();
    assert_eq!(written, 1);

    let text = std::fs::read_to_string(&out).unwrap();
    let event: SecurityEvent = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(event.event_type, SecurityEventType::FileAccessDenied);
    assert_eq!(event.context["path"], "b.txt");
}

#[test]
fn test_policy_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("security.toml");

    let gate = active_gate(
        SecurityConfiguration::builder()
            .max_log_entries(50usize)
            .build()
            .unwrap(),
    );
    gate.set_file_access_policy(policy("*.txt", 10, &[FileAccessType::Read]))
        .unwrap();
    gate.save_policy(&file).unwrap();

    let restored = active_gate(SecurityConfiguration::default());
    restored.load_policy(&file).unwrap();
    assert_eq!(restored.configuration().max_log_entries, 50);
    assert_eq!(restored.active_policies(), gate.active_policies());
    assert!(restored.check_file_access("notes.txt", FileAccessType::Read));

    std::fs::write(&file, "[security]\nmax_log_entries = \"many\"\n").unwrap();
    assert!(restored.load_policy(&file).is_err());
    assert_eq!(restored.configuration().max_log_entries, 50);
}

#[test]
fn test_threats_bounded_by_log_size() {
    let config = SecurityConfiguration::builder()
        .max_log_entries(10usize)
        .build()
        .unwrap();
    let gate = active_gate(config);
    for i in 0..500 {
        assert!(!gate.check_file_access(&format!("../secret{i}"), FileAccessType::Read));
    }
    assert_eq!(gate.recent_events(1000).len(), 10);

    let threats = gate.active_threats();
    assert_eq!(threats.len(), 10);
    assert_eq!(gate.statistics().active_threats, 10);
    assert!(threats.iter().any(|t| t.id.ends_with("../secret499")));

    for threat in &threats {
        assert!(gate.resolve_threat(&threat.id));
    }
    assert!(!gate.has_active_threats());
    assert_eq!(gate.statistics().active_threats, 0);
}

#[test]
fn test_out_of_range_permission_lifetime() {
    let gate = active_gate(SecurityConfiguration::default());
    let host = SecurityContext::new("host");

    let result = gate.grant_permission("plugin.load", &host, Some(chrono::Duration::MAX));
    assert!(matches!(result, Err(SecurityError::InvalidPolicy(_))));
    assert!(!gate.check_permission("plugin.load", &host));
    assert!(gate.last_error().unwrap().contains("out of range"));

    gate.grant_permission("plugin.load", &host, Some(chrono::Duration::days(1)))
        .unwrap();
    assert!(gate.check_permission("plugin.load", &host));
}

#[test]
fn test_empty_path_denial_is_logged() {
    let gate = active_gate(SecurityConfiguration::default());
    for path in ["", "   "] {
        assert!(!gate.check_file_access(path, FileAccessType::Write));
        let event = &gate.recent_events(1)[0];
        assert_eq!(event.event_type, SecurityEventType::FileAccessDenied);
        assert_eq!(event.context.get("access").map(String::as_str), Some("Write"));
    }
    assert_eq!(gate.statistics().blocked_operations, 2);
    assert_eq!(gate.last_error().as_deref(), Some("Empty file path"));
}

#[test]
fn test_module_path_findings_logged_once() {
    let (dir, _path, config) = module_fixture("viewer.so");
    let gate = active_gate(config);

    let planted = dir.path().join("kernel32.dll");
    std::fs::write(&planted, b"x").unwrap();
    assert!(gate.check_module_path(&planted).is_err());
    let hijacks = gate.filtered_events(
        &EventFilter::new().event_type(SecurityEventType::HijackingAttempt),
    );
    assert_eq!(hijacks.len(), 1);

    let before = gate.statistics().total_events;
    assert!(gate.check_module_path(Path::new("/home/someone/viewer.so")).is_err());
    let events = gate.recent_events(10);
    assert_eq!(gate.statistics().total_events, before + 1);
    assert_eq!(events[0].event_type, SecurityEventType::PluginLoadDenied);

    assert!(!gate.validate_load_path(&planted));
    assert_eq!(gate.statistics().hijacking_attempts, 2);
}
