// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Payloads transported on the step and completion queues.

use crate::plan::Step;
use crate::subject::Subject;
use crate::{RequestId, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable identifier suppressing duplicate work for one `(plan, step)`.
///
/// The same key is used across retries of the same step; the queue adapter
/// and the state store both key on it.
pub fn idempotency_key(plan_id: &str, step_id: &str) -> String {
    format!("{plan_id}:{step_id}")
}

/// One unit of work on the steps queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepJob {
    pub plan_id: String,
    pub step: Step,
    /// Zero-based; increments exactly once per retry dispatch.
    #[serde(default)]
    pub attempt: u32,
    pub created_at_ms: u64,
    pub trace_id: TraceId,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

impl StepJob {
    pub fn idempotency_key(&self) -> String {
        idempotency_key(&self.plan_id, &self.step.id)
    }
}

/// Terminal (or streaming) outcome reported on the completions queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    Completed,
    Failed,
    Rejected,
    Running,
}

crate::wire_display! {
    CompletionState {
        Completed => "completed",
        Failed => "failed",
        Rejected => "rejected",
        Running => "running",
    }
}

/// One step outcome on the completions queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub plan_id: String,
    pub step_id: String,
    pub state: CompletionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approvals: Option<BTreeMap<String, bool>>,
}

crate::test_builder! {
    pub struct CompletionBuilder => Completion {
        required {
            plan_id: String = String::from("p1"),
            step_id: String = String::from("s1"),
            state: CompletionState = CompletionState::Completed,
        }
        optional {
            summary: String,
            output: serde_json::Value,
            approvals: BTreeMap<String, bool>,
        }
    }
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
