// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure policy decisions for plan steps.
//!
//! Given a step, its approvals map, and the subject it runs on behalf of,
//! the enforcer returns an allow verdict plus deny reasons. The scheduler
//! distinguishes *blocking* denies (fail the step) from
//! `approval_required` denies (park the step until a human decides).

mod cache;
mod capability;

pub use cache::{CachedEnforcer, DecisionCache, MemoryDecisionCache, RedisDecisionCache};
pub use capability::CapabilityPolicy;

use async_trait::async_trait;
use planq_core::{Step, Subject, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deny reason that parks a step instead of failing it.
pub const APPROVAL_REQUIRED: &str = "approval_required";

/// One reason a step was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyReason {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl DenyReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), capability: None }
    }

    pub fn with_capability(reason: impl Into<String>, capability: impl Into<String>) -> Self {
        Self { reason: reason.into(), capability: Some(capability.into()) }
    }

    pub fn is_approval_required(&self) -> bool {
        self.reason == APPROVAL_REQUIRED
    }
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<DenyReason>,
}

impl PolicyDecision {
    pub fn allow_all() -> Self {
        Self { allow: true, deny: Vec::new() }
    }

    /// Derive the verdict: allowed when no denies remain, or when every
    /// deny is `approval_required` on a step that declares it needs one.
    pub fn from_denies(step: &Step, deny: Vec<DenyReason>) -> Self {
        let allow = deny.is_empty()
            || (step.approval_required && deny.iter().all(DenyReason::is_approval_required));
        Self { allow, deny }
    }

    /// Denies that fail the step outright.
    pub fn blocking_denies(&self) -> Vec<&DenyReason> {
        self.deny.iter().filter(|d| !d.is_approval_required()).collect()
    }

    pub fn requires_approval(&self) -> bool {
        self.deny.iter().any(DenyReason::is_approval_required)
    }
}

/// Evaluation inputs beyond the step itself.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub plan_id: &'a str,
    pub trace_id: &'a TraceId,
    pub approvals: &'a BTreeMap<String, bool>,
    pub subject: Option<&'a Subject>,
}

/// Pure decision function over a step and its context.
#[async_trait]
pub trait PolicyEnforcer: Send + Sync {
    async fn enforce_plan_step(&self, step: &Step, ctx: &PolicyContext<'_>) -> PolicyDecision;
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
