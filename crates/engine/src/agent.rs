// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The external tool agent contract.
//!
//! Execution internals live outside this crate; the engine only needs an
//! async call that yields a stream of events whose final entry carries the
//! terminal state.

use async_trait::async_trait;
use planq_core::Subject;
use planq_cost::{TokenUsage, UsageCarrier};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// What the step consumer hands the tool agent.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub plan_id: String,
    pub step_id: String,
    pub action: String,
    pub tool: String,
    pub input: serde_json::Value,
    pub timeout: Duration,
    pub subject: Option<Subject>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventState {
    Running,
    Completed,
    Failed,
}

/// One progress or terminal event from the tool agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub state: ToolEventState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ToolEvent {
    pub fn completed(summary: impl Into<String>) -> Self {
        Self {
            state: ToolEventState::Completed,
            summary: Some(summary.into()),
            output: None,
            usage: None,
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            state: ToolEventState::Failed,
            summary: Some(summary.into()),
            output: None,
            usage: None,
        }
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Transport- or agent-level failure. `retryable` separates network,
/// timeout, and 5xx-class failures from permanent ones.
#[derive(Debug, Clone, Error)]
#[error("tool agent: {message}")]
pub struct ToolAgentError {
    pub message: String,
    pub retryable: bool,
}

impl ToolAgentError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

/// The sequence of events from one tool invocation.
///
/// Wrapped so the cost tracker can extract token usage from the final
/// event that reports it.
#[derive(Debug, Clone)]
pub struct ToolRun(pub Vec<ToolEvent>);

impl ToolRun {
    /// The event that decides the outcome (last non-running one).
    pub fn terminal(&self) -> Option<&ToolEvent> {
        self.0.iter().rev().find(|e| e.state != ToolEventState::Running)
    }
}

impl UsageCarrier for ToolRun {
    fn usage(&self) -> Option<TokenUsage> {
        self.0.iter().rev().find_map(|e| e.usage)
    }
}

/// External executor of steps.
#[async_trait]
pub trait ToolAgent: Send + Sync {
    async fn execute(&self, invocation: ToolInvocation) -> Result<ToolRun, ToolAgentError>;
}

/// Scripted agent for tests: plays queued results in order, then defaults
/// to completing with "ok". Records every invocation it receives.
#[cfg(any(test, feature = "test-support"))]
pub struct FakeToolAgent {
    script: parking_lot::Mutex<std::collections::VecDeque<Result<ToolRun, ToolAgentError>>>,
    invocations: parking_lot::Mutex<Vec<ToolInvocation>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeToolAgent {
    pub fn new() -> Self {
        Self {
            script: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            invocations: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn push_result(&self, result: Result<ToolRun, ToolAgentError>) {
        self.script.lock().push_back(result);
    }

    pub fn push_completed(&self, summary: &str) {
        self.push_result(Ok(ToolRun(vec![ToolEvent::completed(summary)])));
    }

    pub fn push_failed(&self, summary: &str) {
        self.push_result(Ok(ToolRun(vec![ToolEvent::failed(summary)])));
    }

    pub fn push_retryable_error(&self, message: &str) {
        self.push_result(Err(ToolAgentError::retryable(message)));
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Default for FakeToolAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl ToolAgent for FakeToolAgent {
    async fn execute(&self, invocation: ToolInvocation) -> Result<ToolRun, ToolAgentError> {
        self.invocations.lock().push(invocation);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ToolRun(vec![ToolEvent::completed("ok")])))
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
