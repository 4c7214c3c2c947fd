// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Default capability policy.
//!
//! A step's capability must be covered by the subject's scopes; a scope
//! covers a capability exactly, by `prefix.*` wildcard, or with the global
//! `*`. Steps that declare `approval_required` deny with
//! `approval_required` until the matching approval is recorded.

use crate::{DenyReason, PolicyContext, PolicyDecision, PolicyEnforcer, APPROVAL_REQUIRED};
use async_trait::async_trait;
use planq_core::Step;
use std::collections::BTreeSet;

/// Scope- and approval-based enforcement.
#[derive(Debug, Default)]
pub struct CapabilityPolicy {
    /// Capabilities refused for everyone regardless of scopes.
    denied_capabilities: BTreeSet<String>,
}

impl CapabilityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_capability(mut self, capability: impl Into<String>) -> Self {
        self.denied_capabilities.insert(capability.into());
        self
    }

    fn scope_covers(scope: &str, capability: &str) -> bool {
        if scope == "*" || scope == capability {
            return true;
        }
        scope
            .strip_suffix(".*")
            .is_some_and(|prefix| {
                capability.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.'))
            })
    }
}

#[async_trait]
impl PolicyEnforcer for CapabilityPolicy {
    async fn enforce_plan_step(&self, step: &Step, ctx: &PolicyContext<'_>) -> PolicyDecision {
        let mut deny = Vec::new();

        if self.denied_capabilities.contains(&step.capability) {
            deny.push(DenyReason::with_capability("capability_denied", &step.capability));
        }

        // Scope checks apply only when a subject is carried; subjectless
        // plans are internal and skip identity checks.
        if let Some(subject) = ctx.subject {
            let covered =
                subject.scopes.iter().any(|scope| Self::scope_covers(scope, &step.capability));
            if !covered {
                deny.push(DenyReason::with_capability("missing_capability", &step.capability));
            }
        }

        if step.approval_required && ctx.approvals.get(&step.capability) != Some(&true) {
            deny.push(DenyReason::with_capability(APPROVAL_REQUIRED, &step.capability));
        }

        let decision = PolicyDecision::from_denies(step, deny);
        tracing::debug!(
            plan_id = ctx.plan_id,
            step_id = %step.id,
            capability = %step.capability,
            allow = decision.allow,
            denies = decision.deny.len(),
            "policy evaluated"
        );
        decision
    }
}

#[cfg(test)]
#[path = "capability_tests.rs"]
mod tests;
