//! Priority-ranked file access policies.

use std::collections::BTreeSet;

use derive_builder::Builder;
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{SecurityError, SecurityResult};
use crate::path::{is_path_traversal, normalize};
use crate::types::{AccessDecision, FileAccessType};

/// A rule granting or denying operations on paths matching a pattern.
///
/// Relative patterns match at any depth, so `temp/*` applies to
/// `/var/app/temp/cache.bin` as well as `temp/cache.bin`. A pattern that names
/// a directory also covers everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct FileAccessPolicy {
    /// Glob pattern, with `/` or `\` separators.
    pub pattern: String,

    /// Operations explicitly allowed.
    #[builder(default)]
    #[serde(default)]
    pub allowed: BTreeSet<FileAccessType>,

    /// Operations explicitly denied; overrides `allowed`.
    #[builder(default)]
    #[serde(default)]
    pub denied: BTreeSet<FileAccessType>,

    /// Decision for operations in neither set.
    #[builder(default = "AccessDecision::Deny")]
    #[serde(default = "default_decision")]
    pub default_decision: AccessDecision,

    /// Higher priority wins when several policies match.
    #[builder(default)]
    #[serde(default)]
    pub priority: u32,

    /// If non-empty, only these requesters are subject to the allow rules.
    #[builder(default)]
    #[serde(default)]
    pub trusted_requesters: Vec<String>,
}

fn default_decision() -> AccessDecision {
    AccessDecision::Deny
}

impl FileAccessPolicyBuilder {
    fn validate(&self) -> Result<(), String> {
        let Some(pattern) = &self.pattern else {
            return Err("Pattern is required".to_string());
        };
        if pattern.trim().is_empty() {
            return Err("Pattern cannot be empty".to_string());
        }
        if is_path_traversal(pattern) {
            return Err(format!("Pattern '{pattern}' contains a traversal sequence"));
        }
        Glob::new(&normalize(pattern)).map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl FileAccessPolicy {
    /// Create a new policy builder.
    pub fn builder() -> FileAccessPolicyBuilder {
        FileAccessPolicyBuilder::default()
    }

    /// Reach a decision for one operation.
    ///
    /// A requester outside a non-empty trusted list is denied outright.
    pub fn evaluate(&self, access: FileAccessType, requester: Option<&str>) -> AccessDecision {
        if let Some(requester) = requester
            && !self.trusted_requesters.is_empty()
            && !self.trusted_requesters.iter().any(|r| r == requester)
        {
            return AccessDecision::Deny;
        }

        if self.denied.contains(&access) {
            AccessDecision::Deny
        } else if self.allowed.contains(&access) {
            AccessDecision::Allow
        } else {
            self.default_decision
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledPolicy {
    policy: FileAccessPolicy,
    matcher: GlobSet,
}

fn compile(policy: &FileAccessPolicy) -> SecurityResult<GlobSet> {
    let pattern = normalize(&policy.pattern);
    let pattern = pattern.trim_end_matches('/');

    let mut alternatives = vec![pattern.to_string(), format!("{pattern}/**")];
    if !pattern.starts_with('/') && !pattern.starts_with("**") && !pattern.contains(':') {
        alternatives.push(format!("**/{pattern}"));
        alternatives.push(format!("**/{pattern}/**"));
    }

    let mut builder = GlobSetBuilder::new();
    for alternative in alternatives {
        let glob = GlobBuilder::new(&alternative)
            .case_insensitive(cfg!(windows))
            .build()
            .map_err(|e| SecurityError::InvalidPolicy(format!("{}: {e}", policy.pattern)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SecurityError::InvalidPolicy(format!("{}: {e}", policy.pattern)))
}

/// The active policies, keyed by pattern.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: IndexMap<String, CompiledPolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the policy for its pattern.
    pub fn insert(&mut self, policy: FileAccessPolicy) -> SecurityResult<()> {
        let matcher = compile(&policy)?;
        self.policies
            .insert(policy.pattern.clone(), CompiledPolicy { policy, matcher });
        Ok(())
    }

    /// Remove the policy for `pattern`.
    pub fn remove(&mut self, pattern: &str) -> bool {
        self.policies.shift_remove(pattern).is_some()
    }

    pub fn clear(&mut self) {
        self.policies.clear();
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Policies in registration order.
    pub fn policies(&self) -> impl Iterator<Item = &FileAccessPolicy> {
        self.policies.values().map(|c| &c.policy)
    }

    /// The policy governing `path`: highest priority, then longest pattern.
    pub fn find(&self, path: &str) -> Option<&FileAccessPolicy> {
        let path = normalize(path);
        let path = path.strip_prefix("./").unwrap_or(&path);

        let mut best: Option<&FileAccessPolicy> = None;
        for compiled in self.policies.values() {
            if !compiled.matcher.is_match(path) {
                continue;
            }
            let candidate = &compiled.policy;
            let better = match best {
                None => true,
                Some(current) => {
                    (candidate.priority, candidate.pattern.len())
                        > (current.priority, current.pattern.len())
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best
    }
}
