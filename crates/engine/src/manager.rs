// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The plan queue manager.
//!
//! Owns the plan state machine: submission, the cursor-advance loop,
//! approval resolution, completion application, and rehydration. Every
//! mutation of one plan's metadata or dispatch state runs under the
//! distributed `plan:{plan_id}` lock, and every event is published only
//! after the corresponding store write succeeded.

use crate::error::EngineError;
use crate::registry::{HotRegistry, RegistryEntry};
use planq_core::{
    idempotency_key, Clock, EventBus, Plan, PlanStepEvent, RequestId, Step, StepJob, StepState,
    Subject, SystemClock, TraceId, PLAN_STEPS_QUEUE,
};
use planq_policy::{PolicyContext, PolicyEnforcer};
use planq_queue::{headers, EnqueueOptions, Headers, QueueAdapter, QueueError};
use planq_store::{
    FileLockManager, LockService, PersistedStepEntry, PlanMetadata, PlanStore, RememberStep,
    StepDescriptor,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Lock key serialising all mutations for one plan.
fn plan_lock_key(plan_id: &str) -> String {
    format!("plan:{plan_id}")
}

/// Headers carried on every step job message.
fn job_headers(job: &StepJob, key: &str) -> Headers {
    let mut map = Headers::new();
    map.insert(headers::TRACE_ID.to_string(), job.trace_id.to_string());
    map.insert(headers::REQUEST_ID.to_string(), job.request_id.to_string());
    map.insert(headers::ATTEMPTS.to_string(), job.attempt.to_string());
    map.insert(headers::IDEMPOTENCY_KEY.to_string(), key.to_string());
    map
}

/// Verdict on a parked step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Optional submission inputs.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub request_id: Option<RequestId>,
    pub subject: Option<Subject>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// Collaborators injected into the manager.
pub struct ManagerDeps<C: Clock = SystemClock> {
    pub store: Arc<dyn PlanStore>,
    pub queue: Arc<dyn QueueAdapter>,
    pub locks: Arc<dyn LockService>,
    pub policy: Arc<dyn PolicyEnforcer>,
    pub registry: Arc<HotRegistry>,
    pub bus: EventBus,
    pub file_locks: Option<Arc<FileLockManager>>,
    pub clock: C,
}

/// Tuning for the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Must exceed the worst-case cursor-advance critical section.
    pub lock_ttl: Duration,
    /// Gates persistence and event forwarding of step output.
    pub content_capture: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { lock_ttl: Duration::from_secs(30), content_capture: false }
    }
}

/// The scheduler that converts submitted plans into step dispatches.
pub struct PlanQueueManager<C: Clock = SystemClock> {
    store: Arc<dyn PlanStore>,
    queue: Arc<dyn QueueAdapter>,
    locks: Arc<dyn LockService>,
    policy: Arc<dyn PolicyEnforcer>,
    registry: Arc<HotRegistry>,
    bus: EventBus,
    file_locks: Option<Arc<FileLockManager>>,
    clock: C,
    options: ManagerOptions,
}

impl<C: Clock> PlanQueueManager<C> {
    pub fn new(deps: ManagerDeps<C>, options: ManagerOptions) -> Self {
        Self {
            store: deps.store,
            queue: deps.queue,
            locks: deps.locks,
            policy: deps.policy,
            registry: deps.registry,
            bus: deps.bus,
            file_locks: deps.file_locks,
            clock: deps.clock,
            options,
        }
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<PlanStepEvent> {
        self.bus.subscribe()
    }

    pub fn registry(&self) -> &HotRegistry {
        &self.registry
    }

    fn event(
        &self,
        plan_id: &str,
        step: &Step,
        state: StepState,
        trace_id: &TraceId,
        request_id: Option<&RequestId>,
    ) -> PlanStepEvent {
        PlanStepEvent::new(
            plan_id,
            step,
            state,
            trace_id.clone(),
            request_id.cloned(),
            self.clock.epoch_ms(),
        )
    }

    // ── Submission ───────────────────────────────────────────────────────────

    /// Persist plan metadata and dispatch the first eligible step.
    ///
    /// Fails with [`EngineError::PolicyViolation`] when a blocking deny
    /// hits the first step; the plan does not partially start. Submitting
    /// the same plan again is idempotent: existing cursors are kept and
    /// the release loop simply re-drives.
    pub async fn submit_plan_steps(
        &self,
        plan: &Plan,
        trace_id: TraceId,
        options: SubmitOptions,
    ) -> Result<(), EngineError> {
        let request_id = options.request_id.unwrap_or_default();
        let subject = options.subject;
        let _guard = self.locks.acquire(&plan_lock_key(&plan.id), self.options.lock_ttl).await?;

        let was_new = self.store.get_plan_metadata(&plan.id).await?.is_none();
        if was_new {
            let now = self.clock.epoch_ms();
            let metadata = PlanMetadata {
                plan_id: plan.id.clone(),
                trace_id: trace_id.clone(),
                request_id: request_id.clone(),
                steps: plan
                    .steps
                    .iter()
                    .map(|step| StepDescriptor {
                        step: step.clone(),
                        created_at_ms: now,
                        attempt: 0,
                        request_id: request_id.clone(),
                        subject: subject.clone(),
                    })
                    .collect(),
                next_step_index: 0,
                last_completed_index: -1,
            };
            self.store.remember_plan_metadata(&plan.id, metadata).await?;
            tracing::info!(
                plan_id = %plan.id,
                steps = plan.steps.len(),
                trace_id = %trace_id,
                "plan submitted"
            );
        }

        if let Some(subject) = &subject {
            self.registry.set_subject(&plan.id, subject.clone());
            if was_new {
                if let Some(session_id) = &subject.session_id {
                    let plans = self.registry.increment_session(session_id);
                    if plans == 1 {
                        if let Some(file_locks) = &self.file_locks {
                            file_locks.restore_session_locks(session_id)?;
                        }
                    }
                }
            }
        }

        match self.release_inner(&plan.id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if was_new && matches!(e, EngineError::PolicyViolation(_)) {
                    // Roll the submission back completely.
                    self.store.forget_plan_metadata(&plan.id).await?;
                    self.registry.drop_subject(&plan.id);
                    if let Some(session_id) =
                        subject.as_ref().and_then(|s| s.session_id.as_deref())
                    {
                        if self.registry.decrement_session(session_id) == 0 {
                            if let Some(file_locks) = &self.file_locks {
                                file_locks.release_session_locks(session_id)?;
                            }
                        }
                    }
                }
                Err(e)
            }
        }
    }

    // ── Cursor advance ───────────────────────────────────────────────────────

    /// Dispatch every step the cursors allow. Idempotent; safe to call
    /// repeatedly.
    pub async fn release_next_plan_steps(&self, plan_id: &str) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(&plan_lock_key(plan_id), self.options.lock_ttl).await?;
        self.release_inner(plan_id).await
    }

    /// The cursor-advance loop. Caller holds the plan lock.
    async fn release_inner(&self, plan_id: &str) -> Result<(), EngineError> {
        let Some(mut metadata) = self.store.get_plan_metadata(plan_id).await? else {
            return Ok(());
        };
        let total = metadata.steps.len();

        while metadata.next_step_index < total
            && (metadata.next_step_index as i64) <= metadata.last_completed_index + 1
        {
            let descriptor = metadata.steps[metadata.next_step_index].clone();
            let step = descriptor.step.clone();
            let stored = self.store.get_entry(plan_id, &step.id).await?;

            if let Some(entry) = &stored {
                // Already on the queue, being executed, or finished.
                if entry.state.is_in_flight() || entry.state.is_terminal() {
                    break;
                }
            }

            let attempt = stored.as_ref().map(|e| e.attempt).unwrap_or(descriptor.attempt);
            let key = idempotency_key(plan_id, &step.id);
            let job = StepJob {
                plan_id: plan_id.to_string(),
                step: step.clone(),
                attempt,
                created_at_ms: self.clock.epoch_ms(),
                trace_id: metadata.trace_id.clone(),
                request_id: descriptor.request_id.clone(),
                subject: descriptor.subject.clone(),
            };

            let approvals = self.store.ensure_approvals(plan_id, &step.id).await?;
            let ctx = PolicyContext {
                plan_id,
                trace_id: &metadata.trace_id,
                approvals: &approvals,
                subject: descriptor.subject.as_ref(),
            };
            // Re-evaluated on every dispatch, including already-approved
            // steps: a revoked subject must not ride an old verdict.
            let decision = self.policy.enforce_plan_step(&step, &ctx).await;
            let has_blocking = !decision.blocking_denies().is_empty();
            if !decision.allow && (has_blocking || !step.approval_required) {
                return Err(EngineError::PolicyViolation(decision.deny));
            }

            self.registry.register(
                plan_id,
                RegistryEntry {
                    step: step.clone(),
                    trace_id: metadata.trace_id.clone(),
                    request_id: descriptor.request_id.clone(),
                    job: job.clone(),
                    in_flight: false,
                },
            );

            let requires_approval =
                step.approval_required && approvals.get(&step.capability) != Some(&true);
            if requires_approval {
                if stored.is_none() {
                    self.store
                        .remember_step(
                            plan_id,
                            &step,
                            &metadata.trace_id,
                            RememberStep {
                                initial_state: StepState::WaitingApproval,
                                idempotency_key: key.clone(),
                                attempt,
                                created_at_ms: job.created_at_ms,
                                request_id: Some(descriptor.request_id.clone()),
                                approvals: approvals.clone(),
                                subject: descriptor.subject.clone(),
                            },
                        )
                        .await?;
                }
                self.bus.publish(
                    self.event(
                        plan_id,
                        &step,
                        StepState::WaitingApproval,
                        &metadata.trace_id,
                        Some(&descriptor.request_id),
                    )
                    .attempt(attempt)
                    .summary("Awaiting approval"),
                );
                // The cursor stays here until the approval resolves.
                break;
            }

            if stored.is_none() {
                self.store
                    .remember_step(
                        plan_id,
                        &step,
                        &metadata.trace_id,
                        RememberStep {
                            initial_state: StepState::Queued,
                            idempotency_key: key.clone(),
                            attempt,
                            created_at_ms: job.created_at_ms,
                            request_id: Some(descriptor.request_id.clone()),
                            approvals: approvals.clone(),
                            subject: descriptor.subject.clone(),
                        },
                    )
                    .await?;
            } else {
                // An approved entry advances to queued for dispatch.
                self.store
                    .set_state(plan_id, &step.id, StepState::Queued, None, None, Some(attempt))
                    .await?;
            }

            let payload = serde_json::to_value(&job).map_err(QueueError::from)?;
            let enqueue = self
                .queue
                .enqueue(
                    PLAN_STEPS_QUEUE,
                    payload,
                    EnqueueOptions::new()
                        .idempotency_key(key.clone())
                        .partition_key(plan_id)
                        .headers(job_headers(&job, &key)),
                )
                .await;
            if let Err(e) = enqueue {
                // Restore the invariant: an un-enqueued step leaves no
                // persisted entry behind.
                self.registry.remove(plan_id, &step.id);
                self.store.clear_approvals(plan_id, &step.id).await?;
                self.store.forget_step(plan_id, &step.id).await?;
                self.prune_plan_subject(plan_id).await?;
                return Err(e.into());
            }

            self.bus.publish(
                self.event(
                    plan_id,
                    &step,
                    StepState::Queued,
                    &metadata.trace_id,
                    Some(&descriptor.request_id),
                )
                .attempt(attempt)
                .summary("Queued for execution"),
            );
            metadata.next_step_index += 1;
        }

        if metadata.is_complete() {
            self.store.forget_plan_metadata(plan_id).await?;
            self.finish_plan(plan_id, &metadata).await?;
        } else {
            self.store.remember_plan_metadata(plan_id, metadata).await?;
        }

        let depth = self.queue.depth(PLAN_STEPS_QUEUE).await.unwrap_or(0);
        tracing::debug!(plan_id, queue = PLAN_STEPS_QUEUE, depth, "step queue depth");
        Ok(())
    }

    /// All steps done: release the session at refcount zero and archive
    /// the subject.
    async fn finish_plan(
        &self,
        plan_id: &str,
        metadata: &PlanMetadata,
    ) -> Result<(), EngineError> {
        let subject = self
            .registry
            .subject(plan_id)
            .or_else(|| metadata.steps.first().and_then(|d| d.subject.clone()));
        if let Some(session_id) = subject.as_ref().and_then(|s| s.session_id.as_deref()) {
            if self.registry.decrement_session(session_id) == 0 {
                if let Some(file_locks) = &self.file_locks {
                    file_locks.release_session_locks(session_id)?;
                }
            }
        }
        self.prune_plan_subject(plan_id).await?;
        tracing::info!(plan_id, "plan complete");
        Ok(())
    }

    /// Archive the plan's subject once no registry entry remains for it.
    async fn prune_plan_subject(&self, plan_id: &str) -> Result<(), EngineError> {
        if self.registry.has_entries_for_plan(plan_id) {
            return Ok(());
        }
        if let Some(subject) = self.registry.archive_subject(plan_id) {
            self.store.retain_subject(plan_id, subject).await?;
        }
        Ok(())
    }

    // ── Approvals ────────────────────────────────────────────────────────────

    /// Resolve a parked step. Approval merges the capability into the
    /// approvals map and re-runs the policy check with it; rejection (or
    /// a blocking deny surviving approval) tears the step down.
    pub async fn resolve_plan_step_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        decision: ApprovalDecision,
        summary: Option<String>,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(&plan_lock_key(plan_id), self.options.lock_ttl).await?;

        let (step, trace_id, request_id, subject, attempt) =
            match self.registry.get(plan_id, step_id) {
                Some(entry) => (
                    entry.step,
                    entry.trace_id,
                    Some(entry.request_id),
                    entry.job.subject,
                    entry.job.attempt,
                ),
                None => match self.store.get_entry(plan_id, step_id).await? {
                    Some(entry) => {
                        (entry.step, entry.trace_id, entry.request_id, entry.subject, entry.attempt)
                    }
                    None => {
                        return Err(EngineError::UnknownStep {
                            plan_id: plan_id.to_string(),
                            step_id: step_id.to_string(),
                        })
                    }
                },
            };

        match decision {
            ApprovalDecision::Rejected => {
                self.reject_parked_step(
                    plan_id,
                    &step,
                    &trace_id,
                    request_id.as_ref(),
                    attempt,
                    summary.unwrap_or_else(|| String::from("Approval rejected")),
                )
                .await
            }
            ApprovalDecision::Approved => {
                let mut approvals = self.store.ensure_approvals(plan_id, step_id).await?;
                approvals.insert(step.capability.clone(), true);

                // Approvals mutate the decision inputs; re-run the check.
                let ctx = PolicyContext {
                    plan_id,
                    trace_id: &trace_id,
                    approvals: &approvals,
                    subject: subject.as_ref(),
                };
                let verdict = self.policy.enforce_plan_step(&step, &ctx).await;
                if !verdict.allow || !verdict.blocking_denies().is_empty() {
                    return self
                        .reject_parked_step(
                            plan_id,
                            &step,
                            &trace_id,
                            request_id.as_ref(),
                            attempt,
                            String::from("Policy denied after approval"),
                        )
                        .await;
                }

                self.store.record_approval(plan_id, step_id, &step.capability, true).await?;
                self.store
                    .remember_step(
                        plan_id,
                        &step,
                        &trace_id,
                        RememberStep {
                            initial_state: StepState::Approved,
                            idempotency_key: idempotency_key(plan_id, step_id),
                            attempt,
                            // A fresh createdAt: the step waited, it did
                            // not age.
                            created_at_ms: self.clock.epoch_ms(),
                            request_id: request_id.clone(),
                            approvals: approvals.clone(),
                            subject: subject.clone(),
                        },
                    )
                    .await?;

                self.bus.publish(
                    self.event(plan_id, &step, StepState::Approved, &trace_id, request_id.as_ref())
                        .attempt(attempt)
                        .summary(summary.unwrap_or_else(|| String::from("Approval granted")))
                        .approvals(approvals),
                );

                self.release_inner(plan_id).await
            }
        }
    }

    async fn reject_parked_step(
        &self,
        plan_id: &str,
        step: &Step,
        trace_id: &TraceId,
        request_id: Option<&RequestId>,
        attempt: u32,
        summary: String,
    ) -> Result<(), EngineError> {
        self.store.clear_approvals(plan_id, &step.id).await?;
        self.store.forget_step(plan_id, &step.id).await?;
        self.registry.remove(plan_id, &step.id);
        self.prune_plan_subject(plan_id).await?;
        self.bus.publish(
            self.event(plan_id, step, StepState::Rejected, trace_id, request_id)
                .attempt(attempt)
                .summary(summary),
        );
        Ok(())
    }

    // ── Completion application ───────────────────────────────────────────────

    /// Apply a `completed` completion and drive the next step. One plan
    /// lock critical section covers the state write, cursor advance, and
    /// the follow-on dispatch, so observers see
    /// `completed(step[i])` then `queued(step[i+1])`.
    pub async fn complete_step(
        &self,
        plan_id: &str,
        step_id: &str,
        summary: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(&plan_lock_key(plan_id), self.options.lock_ttl).await?;

        let Some(entry) = self.store.get_entry(plan_id, step_id).await? else {
            return Err(EngineError::UnknownStep {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
            });
        };

        let captured = if self.options.content_capture { output } else { None };
        self.store
            .set_state(
                plan_id,
                step_id,
                StepState::Completed,
                summary.clone(),
                captured.clone(),
                None,
            )
            .await?;
        self.store.forget_step(plan_id, step_id).await?;
        self.registry.remove(plan_id, step_id);

        if let Some(mut metadata) = self.store.get_plan_metadata(plan_id).await? {
            if let Some(index) = metadata.steps.iter().position(|d| d.step.id == step_id) {
                metadata.last_completed_index = metadata.last_completed_index.max(index as i64);
            }
            self.store.remember_plan_metadata(plan_id, metadata).await?;
        }

        let mut event = self
            .event(plan_id, &entry.step, StepState::Completed, &entry.trace_id, entry.request_id.as_ref())
            .attempt(entry.attempt);
        if let Some(summary) = summary {
            event = event.summary(summary);
        }
        if let Some(output) = captured {
            event = event.output(output);
        }
        self.bus.publish(event);

        self.release_inner(plan_id).await?;
        self.prune_plan_subject(plan_id).await
    }

    /// Apply a `failed` or `rejected` completion: the plan halts.
    pub async fn halt_step(
        &self,
        plan_id: &str,
        step_id: &str,
        state: StepState,
        summary: Option<String>,
    ) -> Result<(), EngineError> {
        debug_assert!(matches!(state, StepState::Failed | StepState::Rejected));
        let _guard = self.locks.acquire(&plan_lock_key(plan_id), self.options.lock_ttl).await?;

        let Some(entry) = self.store.get_entry(plan_id, step_id).await? else {
            return Err(EngineError::UnknownStep {
                plan_id: plan_id.to_string(),
                step_id: step_id.to_string(),
            });
        };

        self.store.clear_approvals(plan_id, step_id).await?;
        self.store.forget_step(plan_id, step_id).await?;
        self.registry.remove(plan_id, step_id);
        self.prune_plan_subject(plan_id).await?;

        self.bus.publish(
            self.event(plan_id, &entry.step, state, &entry.trace_id, entry.request_id.as_ref())
                .attempt(entry.attempt)
                .summary(summary.unwrap_or_else(|| format!("Step {state}"))),
        );
        tracing::warn!(plan_id, step_id, state = %state, "plan halted");
        Ok(())
    }

    /// Streaming progress: update state only, no events, no cursors.
    pub async fn update_running(
        &self,
        plan_id: &str,
        step_id: &str,
        summary: Option<String>,
    ) -> Result<(), EngineError> {
        self.store.set_state(plan_id, step_id, StepState::Running, summary, None, None).await?;
        Ok(())
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub async fn get_persisted_plan_step(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<Option<PersistedStepEntry>, EngineError> {
        Ok(self.store.get_entry(plan_id, step_id).await?)
    }

    /// Active subject, or the retained one for a finished plan.
    pub async fn get_plan_subject(&self, plan_id: &str) -> Result<Option<Subject>, EngineError> {
        if let Some(subject) = self.registry.subject(plan_id) {
            return Ok(Some(subject));
        }
        Ok(self.store.get_retained_subject(plan_id).await?)
    }

    /// Cursor positions for operations/debug.
    pub async fn plan_overview(&self) -> Result<Vec<PlanMetadata>, EngineError> {
        Ok(self.store.list_plan_metadata().await?)
    }

    // ── Rehydration ──────────────────────────────────────────────────────────

    /// Re-register every non-terminal entry after a restart. Runs before
    /// consumers start dispatching. Returns the number of entries
    /// restored.
    pub async fn rehydrate(&self) -> Result<usize, EngineError> {
        let entries = self.store.list_active_steps().await?;
        let mut restored_sessions: HashSet<String> = HashSet::new();
        let mut counted_session_plans: HashSet<(String, String)> = HashSet::new();
        let mut approved_plans: HashSet<String> = HashSet::new();
        let count = entries.len();

        for entry in entries {
            let request_id = entry.request_id.clone().unwrap_or_default();
            let job = StepJob {
                plan_id: entry.plan_id.clone(),
                step: entry.step.clone(),
                attempt: entry.attempt,
                created_at_ms: entry.created_at_ms,
                trace_id: entry.trace_id.clone(),
                request_id: request_id.clone(),
                subject: entry.subject.clone(),
            };
            self.registry.register(
                &entry.plan_id,
                RegistryEntry {
                    step: entry.step.clone(),
                    trace_id: entry.trace_id.clone(),
                    request_id: request_id.clone(),
                    job: job.clone(),
                    in_flight: false,
                },
            );

            if let Some(session_id) = entry.subject.as_ref().and_then(|s| s.session_id.clone()) {
                if counted_session_plans.insert((session_id.clone(), entry.plan_id.clone())) {
                    self.registry.increment_session(&session_id);
                }
                if restored_sessions.insert(session_id.clone()) {
                    if let Some(file_locks) = &self.file_locks {
                        file_locks.restore_session_locks(&session_id)?;
                    }
                }
            }

            match entry.state {
                StepState::WaitingApproval => {
                    self.bus.publish(
                        self.event(
                            &entry.plan_id,
                            &entry.step,
                            StepState::WaitingApproval,
                            &entry.trace_id,
                            Some(&request_id),
                        )
                        .attempt(entry.attempt)
                        .summary("Awaiting approval (rehydrated)"),
                    );
                }
                StepState::Queued | StepState::Running | StepState::Retrying => {
                    if entry.state == StepState::Retrying {
                        // Crashed between backoff and redelivery; requeue.
                        self.store
                            .set_state(
                                &entry.plan_id,
                                &entry.step.id,
                                StepState::Queued,
                                None,
                                None,
                                Some(entry.attempt),
                            )
                            .await?;
                    }
                    // The persisted key plus the dedupe service ensure a
                    // job enqueued before the crash is not duplicated.
                    let payload = serde_json::to_value(&job).map_err(QueueError::from)?;
                    self.queue
                        .enqueue(
                            PLAN_STEPS_QUEUE,
                            payload,
                            EnqueueOptions::new()
                                .idempotency_key(entry.idempotency_key.clone())
                                .partition_key(entry.plan_id.clone())
                                .headers(job_headers(&job, &entry.idempotency_key)),
                        )
                        .await?;
                    if entry.state != StepState::Queued {
                        self.bus.publish(
                            self.event(
                                &entry.plan_id,
                                &entry.step,
                                StepState::Queued,
                                &entry.trace_id,
                                Some(&request_id),
                            )
                            .attempt(entry.attempt)
                            .summary("Retry enqueued after restart"),
                        );
                    }
                }
                StepState::Approved => {
                    // Crashed between approval and dispatch; the release
                    // loop re-drives it.
                    approved_plans.insert(entry.plan_id.clone());
                }
                _ => {}
            }
        }

        for plan_id in approved_plans {
            self.release_next_plan_steps(&plan_id).await?;
        }

        if count > 0 {
            tracing::info!(entries = count, "rehydrated in-flight plan state");
        }
        Ok(count)
    }

}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
