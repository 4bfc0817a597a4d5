//! Operation permissions granted to requesters.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SecurityError, SecurityResult};

/// Who is asking for an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Requesting component or plugin.
    pub requester: String,
    /// User on whose behalf the request is made.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl SecurityContext {
    pub fn new(requester: impl Into<String>) -> Self {
        Self {
            requester: requester.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

/// A granted operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub operation: String,
    pub requester: String,
    pub granted_at: DateTime<Utc>,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: String,
}

impl Permission {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now >= expiry)
    }
}

/// Permissions keyed by requester and operation.
#[derive(Debug, Default)]
pub struct PermissionTable {
    grants: HashMap<(String, String), Permission>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `operation` to the context's requester, replacing any earlier
    /// grant.
    pub fn grant(
        &mut self,
        operation: &str,
        context: &SecurityContext,
        ttl: Option<Duration>,
    ) -> SecurityResult<Permission> {
        if operation.trim().is_empty() {
            return Err(SecurityError::InvalidPolicy(
                "Operation name cannot be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let expires_at = match ttl {
            Some(ttl) => Some(now.checked_add_signed(ttl).ok_or_else(|| {
                SecurityError::InvalidPolicy(format!(
                    "Permission lifetime for '{operation}' is out of range"
                ))
            })?),
            None => None,
        };
        let permission = Permission {
            operation: operation.to_string(),
            requester: context.requester.clone(),
            granted_at: now,
            expires_at,
            granted_by: context.user.clone(),
        };
        self.grants.insert(
            (context.requester.clone(), operation.to_string()),
            permission.clone(),
        );
        Ok(permission)
    }

    /// Withdraw a grant. Returns whether one existed.
    pub fn revoke(&mut self, operation: &str, context: &SecurityContext) -> bool {
        self.grants
            .remove(&(context.requester.clone(), operation.to_string()))
            .is_some()
    }

    /// Whether the requester holds an unexpired grant for `operation`.
    pub fn check(&self, operation: &str, context: &SecurityContext) -> bool {
        let now = Utc::now();
        self.grants
            .get(&(context.requester.clone(), operation.to_string()))
            .is_some_and(|p| !p.is_expired_at(now))
    }

    /// Unexpired grants held by the requester, sorted by operation.
    pub fn granted(&self, context: &SecurityContext) -> Vec<Permission> {
        let now = Utc::now();
        let mut permissions: Vec<_> = self
            .grants
            .values()
            .filter(|p| p.requester == context.requester && !p.is_expired_at(now))
            .cloned()
            .collect();
        permissions.sort_by(|a, b| a.operation.cmp(&b.operation));
        permissions
    }

    /// Drop expired grants. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.grants.len();
        self.grants.retain(|_, p| !p.is_expired_at(now));
        before - self.grants.len()
    }

    pub fn clear(&mut self) {
        self.grants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_check_revoke() {
        let mut table = PermissionTable::new();
        let app = SecurityContext::new("viewer").with_user("admin");

        let granted = table.grant("file.write", &app, None).unwrap();
        assert_eq!(granted.granted_by, "admin");
        assert!(table.check("file.write", &app));
        assert!(!table.check("file.delete", &app));

        assert!(table.revoke("file.write", &app));
        assert!(!table.revoke("file.write", &app));
        assert!(!table.check("file.write", &app));
    }

    #[test]
    fn test_grants_are_per_requester() {
        let mut table = PermissionTable::new();
        let viewer = SecurityContext::new("viewer");
        let other = SecurityContext::new("other");

        table.grant("net.connect", &viewer, None).unwrap();
        assert!(!table.check("net.connect", &other));
        assert!(table.granted(&other).is_empty());
        assert_eq!(table.granted(&viewer).len(), 1);
    }

    #[test]
    fn test_expiry() {
        let mut table = PermissionTable::new();
        let ctx = SecurityContext::new("viewer");
        table.grant("old", &ctx, Some(Duration::seconds(-1))).unwrap();
        table.grant("new", &ctx, Some(Duration::hours(1))).unwrap();

        assert!(!table.check("old", &ctx));
        assert!(table.check("new", &ctx));
        let names: Vec<_> = table.granted(&ctx).into_iter().map(|p| p.operation).collect();
        assert_eq!(names, vec!["new".to_string()]);
        assert_eq!(table.purge_expired(), 1);
    }

    #[test]
    fn test_out_of_range_lifetime_rejected() {
        let mut table = PermissionTable::new();
        let ctx = SecurityContext::new("viewer");
        assert!(matches!(
            table.grant("plugin.load", &ctx, Some(Duration::MAX)),
            Err(SecurityError::InvalidPolicy(_))
        ));
        assert!(matches!(
            table.grant("plugin.load", &ctx, Some(Duration::MIN)),
            Err(SecurityError::InvalidPolicy(_))
        ));
        assert!(!table.check("plugin.load", &ctx));
    }

    #[test]
    fn test_empty_operation_rejected() {
        let mut table = PermissionTable::new();
        assert!(table.grant("  ", &SecurityContext::new("x"), None).is_err());
    }
}
