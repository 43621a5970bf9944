// Authorization hook consulted before permission-tagged actions

//! # Authorization
//!
//! The engine asks an [`AuthorizationHook`] only when an action declares a
//! permission tag. A run without a principal is still checked, as the
//! synthetic `anonymous` principal, and the hook decides.
//!
//! [`StaticPolicy`] is an in-memory grant table loaded from configuration:
//!
//! ```text
//! alice=crm.write|slack.post;ops=*;*=log.read
//! ```
//!
//! `*` as a permission grants every tag to that principal; `*` as a
//! principal grants the listed tags to everyone, anonymous included.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::models::Principal;
use crate::{CircuitError, Result};

const WILDCARD: &str = "*";

#[async_trait]
pub trait AuthorizationHook: Send + Sync {
    async fn is_allowed(&self, principal: &Principal, permission: &str) -> bool;
}

/// Allows everything; the engine default
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthorizationHook for AllowAll {
    async fn is_allowed(&self, _principal: &Principal, _permission: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl AuthorizationHook for DenyAll {
    async fn is_allowed(&self, _principal: &Principal, _permission: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, principal: impl Into<String>, permission: impl Into<String>) -> Self {
        self.grants
            .entry(principal.into())
            .or_default()
            .insert(permission.into());
        self
    }

    /// Parse `principal=perm|perm;principal=perm`
    pub fn parse(spec: &str) -> Result<Self> {
        let mut policy = Self::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (principal, permissions) = entry.split_once('=').ok_or_else(|| {
                CircuitError::Config(format!("permission entry '{}' is missing '='", entry))
            })?;
            let principal = principal.trim();
            if principal.is_empty() {
                return Err(CircuitError::Config(format!(
                    "permission entry '{}' has no principal",
                    entry
                )));
            }
            for permission in permissions.split('|').map(str::trim).filter(|p| !p.is_empty()) {
                policy = policy.grant(principal, permission);
            }
        }
        Ok(policy)
    }

    pub fn allows(&self, principal: &str, permission: &str) -> bool {
        let granted = |who: &str| {
            self.grants
                .get(who)
                .map_or(false, |perms| perms.contains(permission) || perms.contains(WILDCARD))
        };
        granted(principal) || granted(WILDCARD)
    }
}

#[async_trait]
impl AuthorizationHook for StaticPolicy {
    async fn is_allowed(&self, principal: &Principal, permission: &str) -> bool {
        let allowed = self.allows(principal.as_str(), permission);
        if !allowed {
            tracing::debug!(principal = %principal, permission, "permission denied");
        }
        allowed
    }
}
