//! Module signature blocks.
//!
//! A module `viewer.so` is signed by a sidecar file `viewer.so.sig` holding a
//! TOML signature block:
//!
//! ```toml
//! subject = "Example Corp"
//! issuer = "Example Root CA"
//! serial = "01"
//! thumbprint = "9f2c..."
//! valid_from = "2026-01-01T00:00:00Z"
//! valid_to = "2027-01-01T00:00:00Z"
//! timestamp = "2026-01-02T10:00:00Z"
//! algorithm = "blake3"
//! digest = "5d1e..."
//! ```
//!
//! The digest is the BLAKE3 hash of the module file. Verification always
//! returns a fresh [`SignatureVerification`]; nothing is cached between calls.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use blake3::Hasher;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SignatureStatus;

/// Digest algorithm recorded in every signature block.
pub const DIGEST_ALGORITHM: &str = "blake3";

/// Extension appended to a module path to locate its signature block.
const SIDECAR_EXTENSION: &str = "sig";

/// Parsed contents of a signature block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// Publisher the certificate was issued to.
    pub subject: String,
    /// Authority that issued the certificate.
    pub issuer: String,
    pub serial: String,
    pub thumbprint: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    /// Time the signature was countersigned, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Hex digest of the module file.
    pub digest: String,
}

fn default_algorithm() -> String {
    DIGEST_ALGORITHM.to_string()
}

impl SignatureInfo {
    /// Whether the certificate was issued by its own subject.
    pub fn is_self_signed(&self) -> bool {
        self.subject.eq_ignore_ascii_case(&self.issuer)
    }
}

/// Rules a signature must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignaturePolicy {
    /// Refuse modules that are not signed.
    pub require_valid_signature: bool,
    pub allow_self_signed: bool,
    /// Require the block to carry a countersignature time.
    pub require_timestamp: bool,
    pub check_certificate_revocation: bool,
    pub require_trusted_publisher: bool,
    pub trusted_publishers: Vec<String>,
    pub blocked_thumbprints: Vec<String>,
    /// Oldest acceptable certificate, measured from `valid_from`.
    pub max_certificate_age_days: u32,
}

impl Default for SignaturePolicy {
    fn default() -> Self {
        Self {
            require_valid_signature: true,
            allow_self_signed: false,
            require_timestamp: true,
            check_certificate_revocation: true,
            require_trusted_publisher: true,
            trusted_publishers: Vec::new(),
            blocked_thumbprints: Vec::new(),
            max_certificate_age_days: 365,
        }
    }
}

impl SignaturePolicy {
    /// A policy that accepts any intact, unexpired block.
    pub fn permissive() -> Self {
        Self {
            require_valid_signature: false,
            allow_self_signed: true,
            require_timestamp: false,
            check_certificate_revocation: false,
            require_trusted_publisher: false,
            ..Self::default()
        }
    }

    /// Trust a publisher.
    pub fn trust_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.trusted_publishers.push(publisher.into());
        self
    }

    /// Block a certificate thumbprint.
    pub fn block_thumbprint(mut self, thumbprint: impl Into<String>) -> Self {
        self.blocked_thumbprints.push(thumbprint.into());
        self
    }

    /// Whether `publisher` is on the trusted list.
    pub fn is_trusted_publisher(&self, publisher: &str) -> bool {
        self.trusted_publishers
            .iter()
            .any(|p| p.eq_ignore_ascii_case(publisher))
    }

    fn is_blocked(&self, thumbprint: &str) -> bool {
        self.blocked_thumbprints
            .iter()
            .any(|t| t.eq_ignore_ascii_case(thumbprint))
    }
}

/// Result of one signature verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureVerification {
    pub status: SignatureStatus,
    /// The parsed block, when one could be read.
    pub info: Option<SignatureInfo>,
    pub message: String,
}

impl SignatureVerification {
    fn new(status: SignatureStatus, info: Option<SignatureInfo>, message: impl Into<String>) -> Self {
        Self {
            status,
            info,
            message: message.into(),
        }
    }

    /// Whether the signature verified.
    pub fn is_valid(&self) -> bool {
        self.status == SignatureStatus::Valid
    }
}

/// Location of the signature block for `module`.
pub fn sidecar_path(module: &Path) -> PathBuf {
    let mut name = module.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Compute the hex BLAKE3 digest of a file.
pub fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Parse the signature block of `module` without checking it.
pub fn read_signature(module: &Path) -> Option<SignatureInfo> {
    let text = std::fs::read_to_string(sidecar_path(module)).ok()?;
    toml::from_str(&text).ok()
}

/// Verify the signature block of `module` against `policy`.
///
/// Checks run in a fixed order and the first failure decides the status:
/// missing block, unreadable module, unparsable block, blocked thumbprint,
/// malformed fields, digest mismatch, validity window, revocation, then
/// publisher trust.
/// `revoked` holds lowercase thumbprints.
pub fn verify_signature(
    module: &Path,
    policy: &SignaturePolicy,
    revoked: &HashSet<String>,
) -> SignatureVerification {
    verify_signature_at(module, policy, revoked, Utc::now())
}

pub(crate) fn verify_signature_at(
    module: &Path,
    policy: &SignaturePolicy,
    revoked: &HashSet<String>,
    now: DateTime<Utc>,
) -> SignatureVerification {
    let sidecar = sidecar_path(module);
    if !sidecar.is_file() {
        return SignatureVerification::new(
            SignatureStatus::NotSigned,
            None,
            format!("No signature block for {}", module.display()),
        );
    }

    let actual = match digest_file(module) {
        Ok(digest) => digest,
        Err(e) => {
            return SignatureVerification::new(
                SignatureStatus::VerificationFailed,
                None,
                format!("Cannot read {}: {e}", module.display()),
            );
        }
    };

    let text = match std::fs::read_to_string(&sidecar) {
        Ok(text) => text,
        Err(e) => {
            return SignatureVerification::new(
                SignatureStatus::VerificationFailed,
                None,
                format!("Cannot read {}: {e}", sidecar.display()),
            );
        }
    };

    let info: SignatureInfo = match toml::from_str(&text) {
        Ok(info) => info,
        Err(e) => {
            return SignatureVerification::new(
                SignatureStatus::Invalid,
                None,
                format!("Malformed signature block: {e}"),
            );
        }
    };

    let fail = |status, message: String| SignatureVerification::new(status, Some(info.clone()), message);

    if policy.is_blocked(&info.thumbprint) {
        return fail(
            SignatureStatus::Invalid,
            format!("Certificate {} is blocked", info.thumbprint),
        );
    }

    if !info.algorithm.eq_ignore_ascii_case(DIGEST_ALGORITHM) {
        return fail(
            SignatureStatus::Invalid,
            format!("Unsupported digest algorithm '{}'", info.algorithm),
        );
    }
    if info.valid_to < info.valid_from {
        return fail(
            SignatureStatus::Invalid,
            "Validity window ends before it starts".to_string(),
        );
    }
    if policy.require_timestamp && info.timestamp.is_none() {
        return fail(
            SignatureStatus::Invalid,
            "Signature block has no timestamp".to_string(),
        );
    }

    if !info.digest.eq_ignore_ascii_case(&actual) {
        return fail(
            SignatureStatus::TamperedFile,
            "Module digest does not match the signature block".to_string(),
        );
    }

    if now < info.valid_from || now > info.valid_to {
        return fail(
            SignatureStatus::ExpiredCertificate,
            format!(
                "Certificate valid from {} to {}",
                info.valid_from.to_rfc3339(),
                info.valid_to.to_rfc3339()
            ),
        );
    }
    let max_age = Duration::days(i64::from(policy.max_certificate_age_days));
    if now - info.valid_from > max_age {
        return fail(
            SignatureStatus::ExpiredCertificate,
            format!(
                "Certificate is older than {} days",
                policy.max_certificate_age_days
            ),
        );
    }

    if policy.check_certificate_revocation
        && revoked.contains(&info.thumbprint.to_ascii_lowercase())
    {
        return fail(
            SignatureStatus::RevokedCertificate,
            format!("Certificate {} has been revoked", info.thumbprint),
        );
    }

    if info.is_self_signed() && !policy.allow_self_signed {
        return fail(
            SignatureStatus::UntrustedPublisher,
            format!("Self-signed certificate from '{}'", info.subject),
        );
    }
    if policy.require_trusted_publisher && !policy.is_trusted_publisher(&info.subject) {
        return fail(
            SignatureStatus::UntrustedPublisher,
            format!("Publisher '{}' is not trusted", info.subject),
        );
    }

    SignatureVerification::new(
        SignatureStatus::Valid,
        Some(info),
        "Signature verified",
    )
}

/// Parameters for producing a signature block.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub valid_from: DateTime<Utc>,
    pub valid_for: Duration,
    /// Stamp the block with the signing time.
    pub timestamp: bool,
}

impl SigningRequest {
    /// A one-year, timestamped request; the issuer defaults to the subject.
    pub fn new(subject: impl Into<String>) -> Self {
        let subject = subject.into();
        let now = Utc::now();
        Self {
            issuer: subject.clone(),
            subject,
            serial: format!("{:x}", now.timestamp_micros()),
            valid_from: now,
            valid_for: Duration::days(365),
            timestamp: true,
        }
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }

    pub fn valid_from(mut self, from: DateTime<Utc>) -> Self {
        self.valid_from = from;
        self
    }

    pub fn valid_for(mut self, duration: Duration) -> Self {
        self.valid_for = duration;
        self
    }

    pub fn timestamp(mut self, timestamp: bool) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn thumbprint(&self) -> String {
        let mut hasher = Hasher::new();
        hasher.update(self.subject.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.issuer.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.serial.as_bytes());
        let hex = hasher.finalize().to_hex();
        hex.as_str()[..40].to_string()
    }
}

/// Write a signature block for `module` and return it.
pub fn sign_module(module: &Path, request: &SigningRequest) -> std::io::Result<SignatureInfo> {
    let valid_to = request
        .valid_from
        .checked_add_signed(request.valid_for)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "certificate validity runs past the representable date range",
            )
        })?;
    let info = SignatureInfo {
        subject: request.subject.clone(),
        issuer: request.issuer.clone(),
        serial: request.serial.clone(),
        thumbprint: request.thumbprint(),
        valid_from: request.valid_from,
        valid_to,
        timestamp: request.timestamp.then(Utc::now),
        algorithm: DIGEST_ALGORITHM.to_string(),
        digest: digest_file(module)?,
    };

    let text = toml::to_string_pretty(&info)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    std::fs::write(sidecar_path(module), text)?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(dir: &Path) -> PathBuf {
        let path = dir.join("viewer.so");
        std::fs::write(&path, b"\x7fELF module bytes").unwrap();
        path
    }

    fn trusted_policy() -> SignaturePolicy {
        SignaturePolicy::default().trust_publisher("Example Corp")
    }

    fn signed(dir: &Path) -> (PathBuf, SignatureInfo) {
        let path = module(dir);
        let info = sign_module(
            &path,
            &SigningRequest::new("Example Corp").issuer("Example Root CA"),
        )
        .unwrap();
        (path, info)
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/p/viewer.so")),
            PathBuf::from("/p/viewer.so.sig")
        );
    }

    #[test]
    fn test_valid_for_trusted_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let (path, info) = signed(dir.path());

        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert!(result.is_valid(), "{}", result.message);
        assert_eq!(result.info, Some(info));
    }

    #[test]
    fn test_not_signed_regardless_of_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(dir.path());

        for policy in [SignaturePolicy::default(), SignaturePolicy::permissive()] {
            let result = verify_signature(&path, &policy, &HashSet::new());
            assert_eq!(result.status, SignatureStatus::NotSigned);
            assert!(result.info.is_none());
        }
    }

    #[test]
    fn test_tampered_module() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = signed(dir.path());
        std::fs::write(&path, b"patched bytes").unwrap();

        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::TamperedFile);
    }

    #[test]
    fn test_malformed_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(dir.path());
        std::fs::write(sidecar_path(&path), "subject = ").unwrap();

        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::Invalid);
    }

    #[test]
    fn test_missing_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(dir.path());
        sign_module(
            &path,
            &SigningRequest::new("Example Corp")
                .issuer("Example Root CA")
                .timestamp(false),
        )
        .unwrap();

        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::Invalid);

        let mut relaxed = trusted_policy();
        relaxed.require_timestamp = false;
        assert!(verify_signature(&path, &relaxed, &HashSet::new()).is_valid());
    }

    #[test]
    fn test_blocked_thumbprint() {
        let dir = tempfile::tempdir().unwrap();
        let (path, info) = signed(dir.path());

        let policy = trusted_policy().block_thumbprint(info.thumbprint.to_uppercase());
        let result = verify_signature(&path, &policy, &HashSet::new());
        assert_eq!(result.status, SignatureStatus::Invalid);
        assert!(result.message.contains("is blocked"), "{}", result.message);
    }

    #[test]
    fn test_blocked_thumbprint_wins_over_later_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(dir.path());
        let info = sign_module(
            &path,
            &SigningRequest::new("Example Corp")
                .issuer("Example Root CA")
                .timestamp(false),
        )
        .unwrap();
        std::fs::write(&path, b"patched bytes").unwrap();

        let policy = trusted_policy().block_thumbprint(info.thumbprint.clone());
        let result = verify_signature(&path, &policy, &HashSet::new());
        assert_eq!(result.status, SignatureStatus::Invalid);
        assert!(result.message.contains("is blocked"), "{}", result.message);

        let mut relaxed = trusted_policy();
        relaxed.require_timestamp = false;
        let result = verify_signature(&path, &relaxed, &HashSet::new());
        assert_eq!(result.status, SignatureStatus::TamperedFile);
    }

    #[test]
    fn test_expired_and_too_old() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(dir.path());
        let past = Utc::now() - Duration::days(30);
        sign_module(
            &path,
            &SigningRequest::new("Example Corp")
                .issuer("Example Root CA")
                .valid_from(past)
                .valid_for(Duration::days(10)),
        )
        .unwrap();
        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::ExpiredCertificate);

        let old = Utc::now() - Duration::days(400);
        sign_module(
            &path,
            &SigningRequest::new("Example Corp")
                .issuer("Example Root CA")
                .valid_from(old)
                .valid_for(Duration::days(800)),
        )
        .unwrap();
        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::ExpiredCertificate);
    }

    #[test]
    fn test_unrepresentable_validity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = module(dir.path());
        let request = SigningRequest::new("Example Corp").valid_for(Duration::MAX);

        let err = sign_module(&path, &request).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(!sidecar_path(&path).exists());
    }

    #[test]
    fn test_not_yet_valid() {
        let dir = tempfile::tempdir().unwrap();
        let (path, info) = signed(dir.path());
        let before = info.valid_from - Duration::days(1);

        let result = verify_signature_at(&path, &trusted_policy(), &HashSet::new(), before);
        assert_eq!(result.status, SignatureStatus::ExpiredCertificate);
    }

    #[test]
    fn test_revoked_only_when_checked() {
        let dir = tempfile::tempdir().unwrap();
        let (path, info) = signed(dir.path());
        let revoked = HashSet::from([info.thumbprint.to_ascii_lowercase()]);

        let result = verify_signature(&path, &trusted_policy(), &revoked);
        assert_eq!(result.status, SignatureStatus::RevokedCertificate);

        let mut policy = trusted_policy();
        policy.check_certificate_revocation = false;
        assert!(verify_signature(&path, &policy, &revoked).is_valid());
    }

    #[test]
    fn test_untrusted_and_self_signed() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = signed(dir.path());
        let result = verify_signature(&path, &SignaturePolicy::default(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::UntrustedPublisher);

        sign_module(&path, &SigningRequest::new("Example Corp")).unwrap();
        let result = verify_signature(&path, &trusted_policy(), &HashSet::new());
        assert_eq!(result.status, SignatureStatus::UntrustedPublisher);

        let mut policy = trusted_policy();
        policy.allow_self_signed = true;
        assert!(verify_signature(&path, &policy, &HashSet::new()).is_valid());
    }
}
