// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plans and their capability-bearing steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An ordered sequence of steps submitted for execution.
///
/// Immutable once submitted; the scheduler tracks progress through cursors
/// in plan metadata, never by mutating the plan itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
}

/// A unit of work bound to one tool invocation and one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the plan.
    pub id: String,
    pub action: String,
    pub tool: String,
    /// Capability the policy engine reasons about (e.g., `repo.write`).
    pub capability: String,
    #[serde(default)]
    pub capability_label: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

crate::test_builder! {
    pub struct StepBuilder => Step {
        required {
            id: String = String::from("s1"),
            action: String = String::from("apply patch"),
            tool: String = String::from("patcher"),
            capability: String = String::from("repo.write"),
            capability_label: String = String::from("Write to repository"),
            labels: BTreeSet<String> = BTreeSet::new(),
            timeout_seconds: u64 = 60,
            approval_required: bool = false,
            input: serde_json::Value = serde_json::Value::Null,
            metadata: serde_json::Value = serde_json::Value::Null,
        }
    }
}

crate::test_builder! {
    pub struct PlanBuilder => Plan {
        required {
            id: String = String::from("p1"),
            goal: String = String::from("test goal"),
            steps: Vec<Step> = Vec::new(),
            success_criteria: Vec<String> = Vec::new(),
        }
    }
}

#[cfg(test)]
#[path = "plan_tests.rs"]
mod tests;
