// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step execution consumer.
//!
//! Dequeues step jobs, runs them through the tool agent with a timeout,
//! and classifies the outcome: success publishes a completion, retryable
//! failures back off and redeliver, permanent failures (or exhausted
//! retries) publish a failed completion. A job whose persisted entry is
//! already terminal is dropped, never re-run.

use crate::agent::{ToolAgent, ToolAgentError, ToolEventState, ToolInvocation, ToolRun};
#[cfg(test)]
use crate::agent::ToolEvent;
use crate::error::EngineError;
use crate::registry::HotRegistry;
use planq_core::{
    Clock, Completion, CompletionState, EventBus, PlanStepEvent, StepJob, StepState, SystemClock,
    PLAN_COMPLETIONS_QUEUE,
};
use planq_cost::{CostTracker, OperationMetadata};
use planq_queue::{
    headers, Disposition, EnqueueOptions, Headers, QueueAdapter, QueueConsumer, QueueError,
    QueueMessage,
};
use planq_store::{PlanStore, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff for attempt `n` (1-based): `base * 2^(n-1)`, capped.
pub fn retry_backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}

/// Tuning for the step consumer.
#[derive(Debug, Clone)]
pub struct StepConsumerOptions {
    /// Total attempts before a retryable failure becomes terminal.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
}

impl Default for StepConsumerOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Registered on [`planq_core::PLAN_STEPS_QUEUE`].
pub struct StepConsumer<C: Clock = SystemClock> {
    store: Arc<dyn PlanStore>,
    queue: Arc<dyn QueueAdapter>,
    agent: Arc<dyn ToolAgent>,
    registry: Arc<HotRegistry>,
    bus: EventBus,
    clock: C,
    options: StepConsumerOptions,
    cost: Option<Arc<CostTracker<C>>>,
}

impl<C: Clock> StepConsumer<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PlanStore>,
        queue: Arc<dyn QueueAdapter>,
        agent: Arc<dyn ToolAgent>,
        registry: Arc<HotRegistry>,
        bus: EventBus,
        clock: C,
        options: StepConsumerOptions,
        cost: Option<Arc<CostTracker<C>>>,
    ) -> Self {
        Self { store, queue, agent, registry, bus, clock, options, cost }
    }

    fn event(&self, job: &StepJob, state: StepState) -> PlanStepEvent {
        PlanStepEvent::new(
            &job.plan_id,
            &job.step,
            state,
            job.trace_id.clone(),
            Some(job.request_id.clone()),
            self.clock.epoch_ms(),
        )
    }

    /// Invoke the tool agent with the step timeout, optionally wrapped by
    /// the cost tracker. Timeouts classify as retryable.
    async fn invoke(&self, job: &StepJob) -> Result<ToolRun, ToolAgentError> {
        let invocation = ToolInvocation {
            plan_id: job.plan_id.clone(),
            step_id: job.step.id.clone(),
            action: job.step.action.clone(),
            tool: job.step.tool.clone(),
            input: job.step.input.clone(),
            timeout: Duration::from_secs(job.step.timeout_seconds),
            subject: job.subject.clone(),
        };
        let timeout = invocation.timeout;
        let agent = Arc::clone(&self.agent);
        let run = async move {
            match tokio::time::timeout(timeout, agent.execute(invocation)).await {
                Ok(result) => result,
                Err(_) => Err(ToolAgentError::retryable(format!(
                    "tool invocation timed out after {}s",
                    timeout.as_secs()
                ))),
            }
        };

        match &self.cost {
            Some(tracker) => {
                let mut metadata = OperationMetadata::new(
                    job.step.tool.clone(),
                    metadata_field(&job.step.metadata, "provider"),
                    metadata_field(&job.step.metadata, "model"),
                )
                .plan_id(job.plan_id.clone())
                .step_id(job.step.id.clone());
                if let Some(tenant) = job.subject.as_ref().and_then(|s| s.tenant_id.clone()) {
                    metadata = metadata.tenant_id(tenant);
                }
                tracker.track_operation(metadata, run).await
            }
            None => run.await,
        }
    }

    async fn publish_completion(
        &self,
        job: &StepJob,
        state: CompletionState,
        summary: Option<String>,
        output: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        let completion = Completion {
            plan_id: job.plan_id.clone(),
            step_id: job.step.id.clone(),
            state,
            summary,
            output,
            approvals: None,
        };
        let key = job.idempotency_key();
        let mut map = Headers::new();
        map.insert(headers::TRACE_ID.to_string(), job.trace_id.to_string());
        map.insert(headers::REQUEST_ID.to_string(), job.request_id.to_string());
        map.insert(headers::IDEMPOTENCY_KEY.to_string(), key);

        let payload = serde_json::to_value(&completion).map_err(QueueError::from)?;
        self.queue
            .enqueue(
                PLAN_COMPLETIONS_QUEUE,
                payload,
                EnqueueOptions::new().partition_key(job.plan_id.clone()).headers(map),
            )
            .await?;
        Ok(())
    }

    async fn process(&self, job: &StepJob, attempt: u32) -> Result<Disposition, EngineError> {
        let Some(stored) = self.store.get_entry(&job.plan_id, &job.step.id).await? else {
            // A crashed enqueue rollback can leave a job with no entry.
            tracing::debug!(
                plan_id = %job.plan_id,
                step_id = %job.step.id,
                "dropping step job with no persisted entry"
            );
            return Ok(Disposition::Ack);
        };
        if stored.state.is_terminal() {
            tracing::debug!(
                plan_id = %job.plan_id,
                step_id = %job.step.id,
                state = %stored.state,
                "dropping step job for terminal entry"
            );
            return Ok(Disposition::Ack);
        }

        if stored.state == StepState::Retrying {
            // Redelivered before the queued write landed; catch up.
            self.store
                .set_state(&job.plan_id, &job.step.id, StepState::Queued, None, None, Some(attempt))
                .await?;
        }

        match self
            .store
            .set_state(&job.plan_id, &job.step.id, StepState::Running, None, None, Some(attempt))
            .await
        {
            Ok(()) => {}
            Err(StoreError::IllegalTransition(e)) => {
                return Ok(Disposition::DeadLetter {
                    reason: Some(format!("invalid_state_transition: {e}")),
                });
            }
            Err(e) => return Err(e.into()),
        }
        self.registry.set_in_flight(&job.plan_id, &job.step.id, true);
        self.bus.publish(self.event(job, StepState::Running).attempt(attempt));

        match self.invoke(job).await {
            Ok(run) => {
                let terminal = run.terminal().cloned();
                match terminal {
                    Some(event) if event.state == ToolEventState::Completed => {
                        self.publish_completion(
                            job,
                            CompletionState::Completed,
                            event.summary.clone(),
                            event.output.clone(),
                        )
                        .await?;
                    }
                    Some(event) => {
                        self.publish_completion(
                            job,
                            CompletionState::Failed,
                            event.summary.clone(),
                            None,
                        )
                        .await?;
                    }
                    None => {
                        self.publish_completion(
                            job,
                            CompletionState::Failed,
                            Some(String::from("tool agent returned no terminal event")),
                            None,
                        )
                        .await?;
                    }
                }
                Ok(Disposition::Ack)
            }
            Err(e) if e.retryable && attempt + 1 < self.options.max_attempts => {
                let delay =
                    retry_backoff(self.options.base_backoff, attempt + 1, self.options.backoff_cap);
                tracing::warn!(
                    plan_id = %job.plan_id,
                    step_id = %job.step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retryable tool failure"
                );
                self.store
                    .set_state(
                        &job.plan_id,
                        &job.step.id,
                        StepState::Retrying,
                        Some(e.message.clone()),
                        None,
                        Some(attempt),
                    )
                    .await?;
                self.bus.publish(
                    self.event(job, StepState::Retrying).attempt(attempt).summary(&e.message),
                );

                // The redelivery is already owed; persist the next attempt.
                self.store
                    .set_state(
                        &job.plan_id,
                        &job.step.id,
                        StepState::Queued,
                        None,
                        None,
                        Some(attempt + 1),
                    )
                    .await?;
                self.bus.publish(
                    self.event(job, StepState::Queued)
                        .attempt(attempt + 1)
                        .summary("Retry queued"),
                );
                self.registry.set_in_flight(&job.plan_id, &job.step.id, false);
                Ok(Disposition::Retry { delay: Some(delay) })
            }
            Err(e) => {
                self.publish_completion(job, CompletionState::Failed, Some(e.message), None)
                    .await?;
                Ok(Disposition::Ack)
            }
        }
    }
}

fn metadata_field(metadata: &serde_json::Value, field: &str) -> String {
    metadata
        .get(field)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl<C: Clock> QueueConsumer for StepConsumer<C> {
    async fn handle(&self, message: QueueMessage) -> Disposition {
        let job: StepJob = match serde_json::from_value(message.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                return Disposition::DeadLetter { reason: Some(format!("malformed_step_job: {e}")) }
            }
        };
        // Payload attempt is the base from dispatch; adapter redeliveries
        // stack on top.
        let attempt = job.attempt + message.attempts;

        match self.process(&job, attempt).await {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::warn!(
                    plan_id = %job.plan_id,
                    step_id = %job.step.id,
                    error = %e,
                    "transient failure processing step job"
                );
                Disposition::Retry { delay: Some(Duration::from_millis(250)) }
            }
        }
    }
}

#[cfg(test)]
#[path = "step_consumer_tests.rs"]
mod tests;
