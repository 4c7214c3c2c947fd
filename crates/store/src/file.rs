// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-backed plan state: one JSON document, written atomically.
//!
//! Suitable for single-node deployments. The document is guarded by an
//! advisory process lock so two orchestrators cannot share one file, and
//! every write goes temp + fsync + rename.

use crate::{
    PersistedStepEntry, PlanMetadata, PlanStore, RememberStep, StoreError, SweepStats,
};
use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use planq_core::{Clock, Step, StepState, Subject, SystemClock, TraceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Current document schema version.
const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetainedSubject {
    subject: Subject,
    retained_at_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    plan_metadata: BTreeMap<String, PlanMetadata>,
    /// plan_id -> step_id -> entry
    #[serde(default)]
    entries: BTreeMap<String, BTreeMap<String, PersistedStepEntry>>,
    #[serde(default)]
    retained_subjects: BTreeMap<String, RetainedSubject>,
}

/// Single-document JSON backend.
pub struct FileStore<C: Clock = SystemClock> {
    path: PathBuf,
    clock: C,
    document: Mutex<Document>,
    /// Held for the store's lifetime; advisory exclusion between processes.
    _lock_file: File,
}

impl FileStore<SystemClock> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, SystemClock)
    }
}

impl<C: Clock> FileStore<C> {
    pub fn open_with_clock(path: impl Into<PathBuf>, clock: C) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = path.with_extension("lock");
        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::LockBusy(lock_path.display().to_string()))?;

        let document = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Document { version: DOCUMENT_VERSION, ..Document::default() }
        };

        Ok(Self { path, clock, document: Mutex::new(document), _lock_file: lock_file })
    }

    /// Mutate the document and persist it atomically.
    fn mutate<R>(&self, f: impl FnOnce(&mut Document, u64) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let now_ms = self.clock.epoch_ms();
        let mut document = self.document.lock();
        let result = f(&mut document, now_ms)?;
        self.persist(&document)?;
        Ok(result)
    }

    fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.document.lock())
    }

    fn persist(&self, document: &Document) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(document)?)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Advance an existing entry per the idempotent remember rules: attempt
/// non-decreasing, state only along the transition graph, never out of a
/// terminal state.
pub(crate) fn advance_entry(entry: &mut PersistedStepEntry, options: &RememberStep, now_ms: u64) {
    if entry.attempt < options.attempt {
        entry.attempt = options.attempt;
    }
    for (capability, value) in &options.approvals {
        entry.approvals.insert(capability.clone(), *value);
    }
    if let Some(subject) = &options.subject {
        entry.subject = Some(subject.clone());
    }
    if let Some(request_id) = &options.request_id {
        entry.request_id = Some(request_id.clone());
    }
    if !entry.state.is_terminal()
        && entry.state != options.initial_state
        && entry.state.can_transition(options.initial_state)
    {
        entry.state = options.initial_state;
        entry.created_at_ms = options.created_at_ms;
    }
    entry.updated_at_ms = now_ms;
}

pub(crate) fn new_entry(
    plan_id: &str,
    step: &Step,
    trace_id: &TraceId,
    options: RememberStep,
    now_ms: u64,
) -> PersistedStepEntry {
    PersistedStepEntry {
        plan_id: plan_id.to_string(),
        step: step.clone(),
        state: options.initial_state,
        attempt: options.attempt,
        created_at_ms: options.created_at_ms,
        trace_id: trace_id.clone(),
        request_id: options.request_id,
        idempotency_key: options.idempotency_key,
        approvals: options.approvals,
        subject: options.subject,
        summary: None,
        output: None,
        updated_at_ms: now_ms,
    }
}

#[async_trait]
impl<C: Clock> PlanStore for FileStore<C> {
    async fn remember_plan_metadata(
        &self,
        plan_id: &str,
        metadata: PlanMetadata,
    ) -> Result<(), StoreError> {
        self.mutate(|doc, _| {
            doc.plan_metadata.insert(plan_id.to_string(), metadata);
            Ok(())
        })
    }

    async fn get_plan_metadata(&self, plan_id: &str) -> Result<Option<PlanMetadata>, StoreError> {
        Ok(self.read(|doc| doc.plan_metadata.get(plan_id).cloned()))
    }

    async fn forget_plan_metadata(&self, plan_id: &str) -> Result<(), StoreError> {
        self.mutate(|doc, _| {
            doc.plan_metadata.remove(plan_id);
            Ok(())
        })
    }

    async fn list_plan_metadata(&self) -> Result<Vec<PlanMetadata>, StoreError> {
        Ok(self.read(|doc| doc.plan_metadata.values().cloned().collect()))
    }

    async fn remember_step(
        &self,
        plan_id: &str,
        step: &Step,
        trace_id: &TraceId,
        options: RememberStep,
    ) -> Result<(), StoreError> {
        self.mutate(|doc, now_ms| {
            let steps = doc.entries.entry(plan_id.to_string()).or_default();
            match steps.get_mut(&step.id) {
                Some(entry) => advance_entry(entry, &options, now_ms),
                None => {
                    steps.insert(
                        step.id.clone(),
                        new_entry(plan_id, step, trace_id, options, now_ms),
                    );
                }
            }
            Ok(())
        })
    }

    async fn set_state(
        &self,
        plan_id: &str,
        step_id: &str,
        state: StepState,
        summary: Option<String>,
        output: Option<serde_json::Value>,
        attempt: Option<u32>,
    ) -> Result<(), StoreError> {
        self.mutate(|doc, now_ms| {
            let entry = doc
                .entries
                .get_mut(plan_id)
                .and_then(|steps| steps.get_mut(step_id))
                .ok_or_else(|| StoreError::MissingEntry {
                    plan_id: plan_id.to_string(),
                    step_id: step_id.to_string(),
                })?;
            entry.state = entry.state.transition(state)?;
            if let Some(summary) = summary {
                entry.summary = Some(summary);
            }
            if let Some(output) = output {
                entry.output = Some(output);
            }
            if let Some(attempt) = attempt {
                entry.attempt = entry.attempt.max(attempt);
            }
            entry.updated_at_ms = now_ms;
            Ok(())
        })
    }

    async fn get_entry(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<Option<PersistedStepEntry>, StoreError> {
        Ok(self.read(|doc| {
            doc.entries.get(plan_id).and_then(|steps| steps.get(step_id)).cloned()
        }))
    }

    async fn forget_step(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError> {
        self.mutate(|doc, _| {
            if let Some(steps) = doc.entries.get_mut(plan_id) {
                steps.remove(step_id);
                if steps.is_empty() {
                    doc.entries.remove(plan_id);
                }
            }
            Ok(())
        })
    }

    async fn list_active_steps(&self) -> Result<Vec<PersistedStepEntry>, StoreError> {
        Ok(self.read(|doc| {
            doc.entries
                .values()
                .flat_map(|steps| steps.values())
                .filter(|entry| !entry.state.is_terminal())
                .cloned()
                .collect()
        }))
    }

    async fn ensure_approvals(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<BTreeMap<String, bool>, StoreError> {
        Ok(self.read(|doc| {
            doc.entries
                .get(plan_id)
                .and_then(|steps| steps.get(step_id))
                .map(|entry| entry.approvals.clone())
                .unwrap_or_default()
        }))
    }

    async fn record_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        capability: &str,
        value: bool,
    ) -> Result<(), StoreError> {
        self.mutate(|doc, now_ms| {
            let entry = doc
                .entries
                .get_mut(plan_id)
                .and_then(|steps| steps.get_mut(step_id))
                .ok_or_else(|| StoreError::MissingEntry {
                    plan_id: plan_id.to_string(),
                    step_id: step_id.to_string(),
                })?;
            entry.approvals.insert(capability.to_string(), value);
            entry.updated_at_ms = now_ms;
            Ok(())
        })
    }

    async fn clear_approvals(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError> {
        self.mutate(|doc, now_ms| {
            if let Some(entry) =
                doc.entries.get_mut(plan_id).and_then(|steps| steps.get_mut(step_id))
            {
                entry.approvals.clear();
                entry.updated_at_ms = now_ms;
            }
            Ok(())
        })
    }

    async fn retain_subject(&self, plan_id: &str, subject: Subject) -> Result<(), StoreError> {
        self.mutate(|doc, now_ms| {
            doc.retained_subjects
                .insert(plan_id.to_string(), RetainedSubject { subject, retained_at_ms: now_ms });
            Ok(())
        })
    }

    async fn get_retained_subject(&self, plan_id: &str) -> Result<Option<Subject>, StoreError> {
        Ok(self.read(|doc| doc.retained_subjects.get(plan_id).map(|r| r.subject.clone())))
    }

    async fn forget_retained_subject(&self, plan_id: &str) -> Result<(), StoreError> {
        self.mutate(|doc, _| {
            doc.retained_subjects.remove(plan_id);
            Ok(())
        })
    }

    async fn sweep(&self, cutoff_ms: u64) -> Result<SweepStats, StoreError> {
        self.mutate(|doc, _| {
            let mut stats = SweepStats::default();
            for steps in doc.entries.values_mut() {
                let before = steps.len();
                steps.retain(|_, entry| {
                    !(entry.state.is_terminal() && entry.updated_at_ms < cutoff_ms)
                });
                stats.entries_removed += (before - steps.len()) as u64;
            }
            doc.entries.retain(|_, steps| !steps.is_empty());

            let before = doc.retained_subjects.len();
            doc.retained_subjects.retain(|_, retained| retained.retained_at_ms >= cutoff_ms);
            stats.subjects_removed = (before - doc.retained_subjects.len()) as u64;
            Ok(stats)
        })
    }
}

#[cfg(test)]
#[path = "file_tests.rs"]
mod tests;
