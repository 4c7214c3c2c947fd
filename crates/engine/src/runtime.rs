// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine assembly.
//!
//! Wires the manager and both consumers over one queue adapter and store,
//! rehydrates in-flight state, and registers the consumers — in that
//! order, so nothing dispatches before rehydration finishes.

use crate::agent::ToolAgent;
use crate::completion_consumer::CompletionConsumer;
use crate::error::EngineError;
use crate::manager::{ManagerDeps, ManagerOptions, PlanQueueManager};
use crate::registry::HotRegistry;
use crate::step_consumer::{StepConsumer, StepConsumerOptions};
use planq_core::{
    Clock, Config, EventBus, PlanStepEvent, SystemClock, PLAN_COMPLETIONS_QUEUE, PLAN_STEPS_QUEUE,
};
use planq_cost::CostTracker;
use planq_policy::PolicyEnforcer;
use planq_queue::QueueAdapter;
use planq_store::{FileLockManager, LockService, PlanStore};
use std::sync::Arc;
use std::time::Duration;

/// Collaborators injected into the runtime.
pub struct RuntimeDeps<C: Clock = SystemClock> {
    pub store: Arc<dyn PlanStore>,
    pub queue: Arc<dyn QueueAdapter>,
    pub locks: Arc<dyn LockService>,
    pub policy: Arc<dyn PolicyEnforcer>,
    pub agent: Arc<dyn ToolAgent>,
    pub file_locks: Option<Arc<FileLockManager>>,
    pub cost: Option<Arc<CostTracker<C>>>,
    pub clock: C,
}

/// Tuning for the runtime and its consumers.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
    pub lock_ttl: Duration,
    pub content_capture: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1000),
            backoff_cap: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(30),
            content_capture: false,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.queue.retry_max_attempts,
            base_backoff: Duration::from_millis(config.queue.retry_base_backoff_ms),
            backoff_cap: Duration::from_millis(config.queue.retry_backoff_cap_ms),
            lock_ttl: Duration::from_millis(config.lock.ttl_ms),
            content_capture: config.retention.content_capture.enabled,
        }
    }
}

/// The assembled engine.
pub struct Runtime<C: Clock = SystemClock> {
    manager: Arc<PlanQueueManager<C>>,
    step_consumer: Arc<StepConsumer<C>>,
    completion_consumer: Arc<CompletionConsumer<C>>,
    queue: Arc<dyn QueueAdapter>,
    file_locks: Option<Arc<FileLockManager>>,
    bus: EventBus,
}

impl<C: Clock> Runtime<C> {
    pub fn new(deps: RuntimeDeps<C>, options: RuntimeOptions) -> Self {
        let registry = Arc::new(HotRegistry::new());
        let bus = EventBus::default();

        let manager = Arc::new(PlanQueueManager::new(
            ManagerDeps {
                store: Arc::clone(&deps.store),
                queue: Arc::clone(&deps.queue),
                locks: Arc::clone(&deps.locks),
                policy: Arc::clone(&deps.policy),
                registry: Arc::clone(&registry),
                bus: bus.clone(),
                file_locks: deps.file_locks.clone(),
                clock: deps.clock.clone(),
            },
            ManagerOptions { lock_ttl: options.lock_ttl, content_capture: options.content_capture },
        ));

        let step_consumer = Arc::new(StepConsumer::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.queue),
            Arc::clone(&deps.agent),
            Arc::clone(&registry),
            bus.clone(),
            deps.clock.clone(),
            StepConsumerOptions {
                max_attempts: options.max_attempts,
                base_backoff: options.base_backoff,
                backoff_cap: options.backoff_cap,
            },
            deps.cost.clone(),
        ));

        let completion_consumer = Arc::new(CompletionConsumer::new(
            Arc::clone(&deps.store),
            Arc::clone(&manager),
            Arc::clone(&registry),
        ));

        Self {
            manager,
            step_consumer,
            completion_consumer,
            queue: deps.queue,
            file_locks: deps.file_locks,
            bus,
        }
    }

    /// Rehydrate persisted in-flight state, then register both consumers.
    /// Returns the number of rehydrated entries.
    pub async fn start(&self) -> Result<usize, EngineError> {
        let restored = self.manager.rehydrate().await?;
        let steps: Arc<dyn planq_queue::QueueConsumer> =
            Arc::clone(&self.step_consumer) as Arc<dyn planq_queue::QueueConsumer>;
        let completions: Arc<dyn planq_queue::QueueConsumer> =
            Arc::clone(&self.completion_consumer) as Arc<dyn planq_queue::QueueConsumer>;
        self.queue.consume(PLAN_STEPS_QUEUE, steps).await?;
        self.queue.consume(PLAN_COMPLETIONS_QUEUE, completions).await?;
        Ok(restored)
    }

    pub fn manager(&self) -> Arc<PlanQueueManager<C>> {
        Arc::clone(&self.manager)
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<PlanStepEvent> {
        self.bus.subscribe()
    }

    /// Stop consuming, close the transport, and drop held file locks
    /// (the manifest survives for the next restore). Idempotent.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.queue.close().await?;
        if let Some(file_locks) = &self.file_locks {
            file_locks.release_all();
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
