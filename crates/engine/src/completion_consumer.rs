// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Completion consumer.
//!
//! Dequeues completion events, matches them against persisted state with
//! a trace-id + idempotency-key guard, and hands them to the manager to
//! apply. Mismatches dead-letter; orphans (no persisted entry at all) are
//! ack-dropped.

use crate::error::EngineError;
use crate::manager::PlanQueueManager;
use crate::registry::HotRegistry;
use planq_core::{Clock, Completion, CompletionState, StepState, SystemClock};
use planq_queue::{headers, Disposition, QueueConsumer, QueueMessage};
use planq_store::{PlanStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Dead-letter reason for guard failures.
const MISMATCH_REASON: &str = "mismatched_trace_or_idempotency";

/// Registered on [`planq_core::PLAN_COMPLETIONS_QUEUE`].
pub struct CompletionConsumer<C: Clock = SystemClock> {
    store: Arc<dyn PlanStore>,
    manager: Arc<PlanQueueManager<C>>,
    registry: Arc<HotRegistry>,
}

impl<C: Clock> CompletionConsumer<C> {
    pub fn new(
        store: Arc<dyn PlanStore>,
        manager: Arc<PlanQueueManager<C>>,
        registry: Arc<HotRegistry>,
    ) -> Self {
        Self { store, manager, registry }
    }

    /// Persisted identity for the guard: hot registry first, store as the
    /// fallback. None means no record of the step anywhere.
    async fn persisted_identity(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<Option<(String, String)>, EngineError> {
        if let Some(entry) = self.registry.get(plan_id, step_id) {
            return Ok(Some((entry.trace_id.to_string(), entry.job.idempotency_key())));
        }
        if let Some(entry) = self.store.get_entry(plan_id, step_id).await? {
            return Ok(Some((entry.trace_id.to_string(), entry.idempotency_key)));
        }
        Ok(None)
    }

    async fn process(
        &self,
        completion: &Completion,
        message: &QueueMessage,
    ) -> Result<Disposition, EngineError> {
        let plan_id = completion.plan_id.as_str();
        let step_id = completion.step_id.as_str();

        let Some((trace_id, idempotency_key)) =
            self.persisted_identity(plan_id, step_id).await?
        else {
            tracing::debug!(plan_id, step_id, "dropping orphan completion");
            return Ok(Disposition::Ack);
        };

        // Both the trace and the idempotency key must match the persisted
        // values; a partial match is an invariant violation.
        let trace_matches = message.header(headers::TRACE_ID) == Some(trace_id.as_str());
        let key_matches =
            message.header(headers::IDEMPOTENCY_KEY) == Some(idempotency_key.as_str());
        if !trace_matches || !key_matches {
            tracing::error!(
                plan_id,
                step_id,
                header_trace = message.header(headers::TRACE_ID).unwrap_or("<missing>"),
                persisted_trace = %trace_id,
                "completion failed the trace/idempotency guard"
            );
            return Ok(Disposition::DeadLetter { reason: Some(MISMATCH_REASON.to_string()) });
        }

        let applied = match completion.state {
            CompletionState::Completed => {
                self.manager
                    .complete_step(
                        plan_id,
                        step_id,
                        completion.summary.clone(),
                        completion.output.clone(),
                    )
                    .await
            }
            CompletionState::Failed => {
                self.manager
                    .halt_step(plan_id, step_id, StepState::Failed, completion.summary.clone())
                    .await
            }
            CompletionState::Rejected => {
                self.manager
                    .halt_step(plan_id, step_id, StepState::Rejected, completion.summary.clone())
                    .await
            }
            CompletionState::Running => {
                self.manager.update_running(plan_id, step_id, completion.summary.clone()).await
            }
        };

        match applied {
            Ok(()) => Ok(Disposition::Ack),
            // A replayed completion for an already-forgotten step.
            Err(EngineError::UnknownStep { .. })
            | Err(EngineError::Store(StoreError::MissingEntry { .. })) => Ok(Disposition::Ack),
            Err(EngineError::Store(StoreError::IllegalTransition(e))) => {
                Ok(Disposition::DeadLetter {
                    reason: Some(format!("invalid_state_transition: {e}")),
                })
            }
            Err(EngineError::PolicyViolation(denies)) => {
                // The completion itself was applied; the follow-on
                // dispatch hit a revoked subject. The plan stalls until
                // an operator intervenes.
                tracing::warn!(plan_id, step_id, ?denies, "next step blocked by policy");
                Ok(Disposition::Ack)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<C: Clock> QueueConsumer for CompletionConsumer<C> {
    async fn handle(&self, message: QueueMessage) -> Disposition {
        let completion: Completion = match serde_json::from_value(message.payload.clone()) {
            Ok(completion) => completion,
            Err(e) => {
                return Disposition::DeadLetter {
                    reason: Some(format!("malformed_completion: {e}")),
                }
            }
        };

        match self.process(&completion, &message).await {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::warn!(
                    plan_id = %completion.plan_id,
                    step_id = %completion.step_id,
                    error = %e,
                    "transient failure applying completion"
                );
                Disposition::Retry { delay: Some(Duration::from_millis(250)) }
            }
        }
    }
}

#[cfg(test)]
#[path = "completion_consumer_tests.rs"]
mod tests;
