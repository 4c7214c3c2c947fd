// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness for the scenario specs.

use planq_core::{Plan, PlanStepEvent, Step, StepState, SystemClock, TraceId};
use planq_engine::{FakeToolAgent, Runtime, RuntimeDeps, RuntimeOptions, ToolAgent};
use planq_policy::CapabilityPolicy;
use planq_queue::{BrokerQueue, MemoryDedupe};
use planq_store::{FileStore, LocalLockService, PlanStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct Spec {
    pub runtime: Runtime<SystemClock>,
    pub agent: Arc<FakeToolAgent>,
    pub store: Arc<dyn PlanStore>,
    pub queue: BrokerQueue,
    _dir: tempfile::TempDir,
}

pub fn spec() -> Spec {
    spec_with(RuntimeOptions {
        base_backoff: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        ..RuntimeOptions::default()
    })
}

pub fn spec_with(options: RuntimeOptions) -> Spec {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn PlanStore> =
        Arc::new(FileStore::open(dir.path().join("state.json")).expect("store"));
    let queue =
        BrokerQueue::new(Arc::new(MemoryDedupe::new()), Duration::from_secs(60), 4);
    let agent = Arc::new(FakeToolAgent::new());
    let runtime = Runtime::new(
        RuntimeDeps {
            store: Arc::clone(&store),
            queue: Arc::new(queue.clone()),
            locks: Arc::new(LocalLockService::default()),
            policy: Arc::new(CapabilityPolicy::new()),
            agent: Arc::clone(&agent) as Arc<dyn ToolAgent>,
            file_locks: None,
            cost: None,
            clock: SystemClock,
        },
        options,
    );
    Spec { runtime, agent, store, queue, _dir: dir }
}

pub fn auto_step(id: &str) -> Step {
    Step::builder().id(id).build()
}

pub fn gated_step(id: &str) -> Step {
    Step::builder().id(id).approval_required(true).build()
}

pub fn plan(id: &str, steps: Vec<Step>) -> Plan {
    Plan::builder().id(id).steps(steps).build()
}

pub fn trace(id: &str) -> TraceId {
    TraceId::from_string(id)
}

/// `(step_id, state, attempt)` triple for compact assertions.
pub type Seen = (String, StepState, Option<u32>);

pub fn seen(event: &PlanStepEvent) -> Seen {
    (event.step.id.clone(), event.step.state, event.step.attempt)
}

/// Collect events until `step_id` reaches `state`, panicking on timeout.
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<PlanStepEvent>,
    step_id: &str,
    state: StepState,
) -> Vec<PlanStepEvent> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {step_id} -> {state}; saw {:?}",
                    collected.iter().map(seen).collect::<Vec<_>>()
                )
            })
            .expect("bus open");
        let done = event.step.id == step_id && event.step.state == state;
        collected.push(event);
        if done {
            return collected;
        }
    }
}

/// Assert no further event arrives within a short grace window.
pub async fn assert_quiet(events: &mut broadcast::Receiver<PlanStepEvent>) {
    let extra = tokio::time::timeout(Duration::from_millis(150), events.recv()).await;
    if let Ok(Ok(event)) = extra {
        panic!("unexpected event: {:?}", seen(&event));
    }
}
