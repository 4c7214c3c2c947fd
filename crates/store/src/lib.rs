// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable plan state.
//!
//! The [`PlanStore`] owns every step's lifecycle record and the per-plan
//! metadata driving the scheduler's cursors. Two backends implement it: a
//! single-document JSON file for single-node deployments and a relational
//! schema for shared ones. The crate also hosts the distributed lock
//! service and the session-scoped file lock manager.

mod file;
mod flock;
mod lock;
pub mod relational;
mod retention;

pub use file::FileStore;
pub use flock::{FileLockManager, SessionLockError};
pub use lock::{LocalLockService, LockGuard, LockService, RedisLockService};
pub use relational::SqliteStore;
pub use retention::RetentionSweeper;

use async_trait::async_trait;
use planq_core::{RequestId, Step, StepState, Subject, TraceId, TransitionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store sql: {0}")]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),
    #[error("no persisted entry for ({plan_id}, {step_id})")]
    MissingEntry { plan_id: String, step_id: String },
    #[error("lock '{0}' is busy")]
    LockBusy(String),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Per-step descriptor inside plan metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub step: Step,
    pub created_at_ms: u64,
    #[serde(default)]
    pub attempt: u32,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

/// Ordered step list plus the cursors driving sequential progression.
///
/// Invariant: `last_completed_index < next_step_index <= steps.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub plan_id: String,
    pub trace_id: TraceId,
    pub request_id: RequestId,
    pub steps: Vec<StepDescriptor>,
    #[serde(default)]
    pub next_step_index: usize,
    /// -1 until the first step completes.
    pub last_completed_index: i64,
}

impl PlanMetadata {
    /// All steps dispatched and all steps completed.
    pub fn is_complete(&self) -> bool {
        self.next_step_index >= self.steps.len()
            && self.last_completed_index >= self.steps.len() as i64 - 1
    }
}

/// Durable record of one step's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStepEntry {
    pub plan_id: String,
    pub step: Step,
    pub state: StepState,
    #[serde(default)]
    pub attempt: u32,
    pub created_at_ms: u64,
    pub trace_id: TraceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    /// `{plan_id}:{step_id}`; stable across retries.
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub approvals: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub updated_at_ms: u64,
}

/// Options for [`PlanStore::remember_step`].
#[derive(Debug, Clone)]
pub struct RememberStep {
    pub initial_state: StepState,
    pub idempotency_key: String,
    pub attempt: u32,
    pub created_at_ms: u64,
    pub request_id: Option<RequestId>,
    pub approvals: BTreeMap<String, bool>,
    pub subject: Option<Subject>,
}

/// What a retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub entries_removed: u64,
    pub subjects_removed: u64,
}

/// Durable record of plan metadata and step entries.
///
/// All operations tolerate concurrent callers; cross-worker exclusion for
/// read-modify-write sequences comes from the plan lock, not the store.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn remember_plan_metadata(
        &self,
        plan_id: &str,
        metadata: PlanMetadata,
    ) -> Result<(), StoreError>;

    async fn get_plan_metadata(&self, plan_id: &str) -> Result<Option<PlanMetadata>, StoreError>;

    async fn forget_plan_metadata(&self, plan_id: &str) -> Result<(), StoreError>;

    /// For operations/debug surfaces.
    async fn list_plan_metadata(&self) -> Result<Vec<PlanMetadata>, StoreError>;

    /// Idempotent by idempotency key: an existing entry only has fields
    /// updated that can legitimately advance (attempt non-decreasing,
    /// state per the transition graph, never out of a terminal state).
    async fn remember_step(
        &self,
        plan_id: &str,
        step: &Step,
        trace_id: &TraceId,
        options: RememberStep,
    ) -> Result<(), StoreError>;

    /// Apply an allowed transition; refuses illegal ones.
    async fn set_state(
        &self,
        plan_id: &str,
        step_id: &str,
        state: StepState,
        summary: Option<String>,
        output: Option<serde_json::Value>,
        attempt: Option<u32>,
    ) -> Result<(), StoreError>;

    async fn get_entry(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<Option<PersistedStepEntry>, StoreError>;

    async fn forget_step(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError>;

    /// Every non-terminal entry; used at startup for rehydration.
    async fn list_active_steps(&self) -> Result<Vec<PersistedStepEntry>, StoreError>;

    /// Create-if-absent and return the approvals map for a step.
    async fn ensure_approvals(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<BTreeMap<String, bool>, StoreError>;

    async fn record_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        capability: &str,
        value: bool,
    ) -> Result<(), StoreError>;

    async fn clear_approvals(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError>;

    /// Archive a subject for a plan whose registry entries are gone.
    async fn retain_subject(&self, plan_id: &str, subject: Subject) -> Result<(), StoreError>;

    async fn get_retained_subject(&self, plan_id: &str) -> Result<Option<Subject>, StoreError>;

    async fn forget_retained_subject(&self, plan_id: &str) -> Result<(), StoreError>;

    /// Remove terminal entries not updated since `cutoff_ms` and prune the
    /// retained-subject archive with them. `waiting_approval` entries are
    /// never age-pruned.
    async fn sweep(&self, cutoff_ms: u64) -> Result<SweepStats, StoreError>;
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
