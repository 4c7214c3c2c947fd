// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Plan event bus.
//!
//! Every state change publishes a [`PlanStepEvent`] after the corresponding
//! store write succeeds. Delivery is at-least-once; consumers dedupe on
//! [`PlanStepEvent::dedupe_key`].

use crate::clock::rfc3339_ms;
use crate::plan::Step;
use crate::state::StepState;
use crate::{RequestId, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;

/// Step fields carried on an event, plus lifecycle annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStep {
    pub id: String,
    pub action: String,
    pub tool: String,
    pub capability: String,
    #[serde(default)]
    pub capability_label: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub approval_required: bool,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approvals: Option<BTreeMap<String, bool>>,
}

/// Outbound record published for every step state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepEvent {
    /// Always `"plan.step"`.
    pub event: String,
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub plan_id: String,
    /// RFC3339 UTC.
    pub occurred_at: String,
    pub step: EventStep,
}

impl PlanStepEvent {
    /// Build an event from a step and its lifecycle annotations.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_id: impl Into<String>,
        step: &Step,
        state: StepState,
        trace_id: TraceId,
        request_id: Option<RequestId>,
        epoch_ms: u64,
    ) -> Self {
        Self {
            event: "plan.step".to_string(),
            trace_id,
            request_id,
            plan_id: plan_id.into(),
            occurred_at: rfc3339_ms(epoch_ms),
            step: EventStep {
                id: step.id.clone(),
                action: step.action.clone(),
                tool: step.tool.clone(),
                capability: step.capability.clone(),
                capability_label: step.capability_label.clone(),
                labels: step.labels.clone(),
                timeout_seconds: step.timeout_seconds,
                approval_required: step.approval_required,
                state,
                attempt: None,
                summary: None,
                output: None,
                approvals: None,
            },
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.step.attempt = Some(attempt);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.step.summary = Some(summary.into());
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.step.output = Some(output);
        self
    }

    pub fn approvals(mut self, approvals: BTreeMap<String, bool>) -> Self {
        self.step.approvals = Some(approvals);
        self
    }

    /// Key consumers dedupe on under at-least-once delivery.
    pub fn dedupe_key(&self) -> (String, String, StepState, Option<u32>) {
        (self.plan_id.clone(), self.step.id.clone(), self.step.state, self.step.attempt)
    }
}

/// At-least-once fan-out bus for [`PlanStepEvent`].
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PlanStepEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn publish(&self, event: PlanStepEvent) {
        tracing::debug!(
            plan_id = %event.plan_id,
            step_id = %event.step.id,
            state = %event.step.state,
            "plan.step event"
        );
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanStepEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
