// ABOUTME: Authorization gate consulted before privileged sandbox operations
// ABOUTME: Allow-all default and an owner allowlist driven by configuration

use crate::types::Operation;
use async_trait::async_trait;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// External yes/no gate for `(owner, operation, sandbox?)`
#[async_trait]
pub trait PolicyCheck: Send + Sync {
    async fn authorize(
        &self,
        owner_ref: &str,
        operation: Operation,
        sandbox_id: Option<&str>,
    ) -> PolicyDecision;
}

pub struct AllowAllPolicy;

#[async_trait]
impl PolicyCheck for AllowAllPolicy {
    async fn authorize(&self, _: &str, _: Operation, _: Option<&str>) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Only listed owners may create, update or delete sandboxes
pub struct OwnerAllowlistPolicy {
    owners: HashSet<String>,
}

impl OwnerAllowlistPolicy {
    pub fn new<I, S>(owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owners: owners.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PolicyCheck for OwnerAllowlistPolicy {
    async fn authorize(
        &self,
        owner_ref: &str,
        operation: Operation,
        _sandbox_id: Option<&str>,
    ) -> PolicyDecision {
        if self.owners.contains(owner_ref) {
            PolicyDecision::Allow
        } else {
            PolicyDecision::Deny(format!(
                "owner '{}' may not {} sandboxes",
                owner_ref,
                operation.as_str()
            ))
        }
    }
}
