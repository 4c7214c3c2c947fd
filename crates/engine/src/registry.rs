// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-process hot registry.
//!
//! A transient mirror of persisted step metadata for hot-path decisions.
//! Never authoritative: cross-worker correctness comes from the plan lock
//! plus idempotent store writes. Also tracks plan subjects, a bounded
//! retained-subject archive, and per-session plan refcounts.

use parking_lot::Mutex;
use planq_core::{RequestId, Step, StepJob, Subject, TraceId};
use std::collections::{HashMap, VecDeque};

/// Cap on the in-memory retained-subject archive.
const RETAINED_SUBJECT_CAP: usize = 1024;

/// Mirror of one pending step.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub step: Step,
    pub trace_id: TraceId,
    pub request_id: RequestId,
    pub job: StepJob,
    pub in_flight: bool,
}

#[derive(Default)]
struct RegistryState {
    /// (plan_id, step_id) -> entry
    entries: HashMap<(String, String), RegistryEntry>,
    /// Active plan subjects, kept while any entry for the plan remains.
    subjects: HashMap<String, Subject>,
    /// Archived subjects for finished plans, oldest evicted at the cap.
    retained: HashMap<String, Subject>,
    retained_order: VecDeque<String>,
    /// session_id -> number of live plans in that session.
    session_refcounts: HashMap<String, u32>,
}

/// Shared in-process registry.
#[derive(Default)]
pub struct HotRegistry {
    state: Mutex<RegistryState>,
}

impl HotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plan_id: &str, entry: RegistryEntry) {
        let mut state = self.state.lock();
        if let Some(subject) = &entry.job.subject {
            state.subjects.insert(plan_id.to_string(), subject.clone());
        }
        state.entries.insert((plan_id.to_string(), entry.step.id.clone()), entry);
    }

    pub fn get(&self, plan_id: &str, step_id: &str) -> Option<RegistryEntry> {
        self.state.lock().entries.get(&(plan_id.to_string(), step_id.to_string())).cloned()
    }

    pub fn remove(&self, plan_id: &str, step_id: &str) -> Option<RegistryEntry> {
        self.state.lock().entries.remove(&(plan_id.to_string(), step_id.to_string()))
    }

    pub fn set_in_flight(&self, plan_id: &str, step_id: &str, in_flight: bool) {
        let mut state = self.state.lock();
        if let Some(entry) =
            state.entries.get_mut(&(plan_id.to_string(), step_id.to_string()))
        {
            entry.in_flight = in_flight;
        }
    }

    pub fn has_entries_for_plan(&self, plan_id: &str) -> bool {
        self.state.lock().entries.keys().any(|(plan, _)| plan == plan_id)
    }

    /// The subject for an active plan, or the archived one.
    pub fn subject(&self, plan_id: &str) -> Option<Subject> {
        let state = self.state.lock();
        state.subjects.get(plan_id).or_else(|| state.retained.get(plan_id)).cloned()
    }

    pub fn set_subject(&self, plan_id: &str, subject: Subject) {
        self.state.lock().subjects.insert(plan_id.to_string(), subject);
    }

    /// Move a plan's subject from the active map to the bounded archive.
    /// Returns it for durable archival by the caller.
    pub fn archive_subject(&self, plan_id: &str) -> Option<Subject> {
        let mut state = self.state.lock();
        let subject = state.subjects.remove(plan_id)?;
        if !state.retained.contains_key(plan_id) {
            state.retained_order.push_back(plan_id.to_string());
            while state.retained_order.len() > RETAINED_SUBJECT_CAP {
                if let Some(evicted) = state.retained_order.pop_front() {
                    state.retained.remove(&evicted);
                }
            }
        }
        state.retained.insert(plan_id.to_string(), subject.clone());
        Some(subject)
    }

    pub fn drop_subject(&self, plan_id: &str) {
        let mut state = self.state.lock();
        state.subjects.remove(plan_id);
        state.retained.remove(plan_id);
        state.retained_order.retain(|p| p != plan_id);
    }

    /// Bump a session's live-plan count, returning the new count.
    pub fn increment_session(&self, session_id: &str) -> u32 {
        let mut state = self.state.lock();
        let count = state.session_refcounts.entry(session_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a session's live-plan count, returning the new count. The
    /// session entry disappears at zero.
    pub fn decrement_session(&self, session_id: &str) -> u32 {
        let mut state = self.state.lock();
        match state.session_refcounts.get_mut(session_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                let remaining = *count;
                if remaining == 0 {
                    state.session_refcounts.remove(session_id);
                }
                remaining
            }
            None => 0,
        }
    }

    pub fn session_refcount(&self, session_id: &str) -> u32 {
        self.state.lock().session_refcounts.get(session_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
