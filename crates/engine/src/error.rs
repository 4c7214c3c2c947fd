// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine error taxonomy.
//!
//! Transient kinds are translated into queue dispositions at the consumer
//! boundary; semantic kinds surface to callers or as terminal events on
//! the plan bus.

use planq_policy::DenyReason;
use planq_queue::QueueError;
use planq_store::{SessionLockError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Blocking policy deny at submit or approval time. No state changed.
    #[error("policy violation: {}", format_denies(.0))]
    PolicyViolation(Vec<DenyReason>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    SessionLock(#[from] SessionLockError),

    #[error("unknown plan '{0}'")]
    UnknownPlan(String),

    #[error("no step '{step_id}' pending for plan '{plan_id}'")]
    UnknownStep { plan_id: String, step_id: String },

    #[error("invariant violation: {0}")]
    Invariant(String),
}

fn format_denies(denies: &[DenyReason]) -> String {
    let parts: Vec<String> = denies
        .iter()
        .map(|d| match &d.capability {
            Some(capability) => format!("{} ({capability})", d.reason),
            None => d.reason.clone(),
        })
        .collect();
    parts.join(", ")
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
