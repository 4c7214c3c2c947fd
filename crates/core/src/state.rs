// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step lifecycle state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a plan step.
///
/// ```text
/// waiting_approval ─┬─ approved ─▶ queued ─▶ running ─┬─ completed
///                   └─ rejected                       ├─ failed
///                                                     └─ retrying ─▶ queued
/// ```
///
/// `completed`, `failed`, and `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    WaitingApproval,
    Approved,
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Rejected,
}

crate::wire_display! {
    StepState {
        WaitingApproval => "waiting_approval",
        Approved => "approved",
        Queued => "queued",
        Running => "running",
        Retrying => "retrying",
        Completed => "completed",
        Failed => "failed",
        Rejected => "rejected",
    }
}

/// Attempted an illegal lifecycle transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("illegal step transition {from} -> {to}")]
pub struct TransitionError {
    pub from: StepState,
    pub to: StepState,
}

impl StepState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed | StepState::Rejected)
    }

    /// States that count as work in flight on the steps queue.
    pub fn is_in_flight(self) -> bool {
        matches!(self, StepState::Queued | StepState::Running | StepState::Retrying)
    }

    /// Whether `self -> next` is permitted.
    ///
    /// Same-state transitions are allowed so that replayed writes stay
    /// idempotent.
    pub fn can_transition(self, next: StepState) -> bool {
        use StepState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (WaitingApproval, Approved)
                | (WaitingApproval, Rejected)
                | (Approved, Queued)
                | (Queued, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Queued)
        )
    }

    /// Check a transition, returning the error form for store callers.
    pub fn transition(self, next: StepState) -> Result<StepState, TransitionError> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting_approval" => Ok(StepState::WaitingApproval),
            "approved" => Ok(StepState::Approved),
            "queued" => Ok(StepState::Queued),
            "running" => Ok(StepState::Running),
            "retrying" => Ok(StepState::Retrying),
            "completed" => Ok(StepState::Completed),
            "failed" => Ok(StepState::Failed),
            "rejected" => Ok(StepState::Rejected),
            other => Err(format!("unknown step state '{other}'")),
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
