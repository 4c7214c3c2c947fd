// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use planq_core::{FakeClock, PlanStepEvent};
use planq_policy::CapabilityPolicy;
use planq_queue::{BrokerQueue, MemoryDedupe, QueueAdapter};
use planq_store::{FileStore, LocalLockService};
use tokio::sync::broadcast;

struct Harness {
    manager: PlanQueueManager<FakeClock>,
    store: Arc<dyn PlanStore>,
    queue: BrokerQueue,
    registry: Arc<HotRegistry>,
    events: broadcast::Receiver<PlanStepEvent>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(ManagerOptions::default())
}

fn harness_with(options: ManagerOptions) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = FakeClock::new();
    let store: Arc<dyn PlanStore> = Arc::new(
        FileStore::open_with_clock(dir.path().join("state.json"), clock.clone()).expect("store"),
    );
    let queue = BrokerQueue::new(
        Arc::new(MemoryDedupe::new()),
        Duration::from_secs(60),
        4,
    );
    let registry = Arc::new(HotRegistry::new());
    let bus = planq_core::EventBus::default();
    let events = bus.subscribe();
    let manager = PlanQueueManager::new(
        ManagerDeps {
            store: Arc::clone(&store),
            queue: Arc::new(queue.clone()),
            locks: Arc::new(LocalLockService::default()),
            policy: Arc::new(CapabilityPolicy::new()),
            registry: Arc::clone(&registry),
            bus,
            file_locks: None,
            clock,
        },
        options,
    );
    Harness { manager, store, queue, registry, events, _dir: dir }
}

fn drain(events: &mut broadcast::Receiver<PlanStepEvent>) -> Vec<PlanStepEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn states(events: &[PlanStepEvent]) -> Vec<(String, StepState)> {
    events.iter().map(|e| (e.step.id.clone(), e.step.state)).collect()
}

fn two_step_plan(id: &str) -> Plan {
    Plan::builder()
        .id(id)
        .steps(vec![Step::builder().id("s1").build(), Step::builder().id("s2").build()])
        .build()
}

// ── Submission / dispatch ────────────────────────────────────────────────────

#[tokio::test]
async fn submit_dispatches_only_the_first_step() {
    let mut h = harness();
    h.manager
        .submit_plan_steps(&two_step_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");

    let events = drain(&mut h.events);
    assert_eq!(states(&events), vec![("s1".to_string(), StepState::Queued)]);

    let s1 = h.store.get_entry("p1", "s1").await.expect("get").expect("entry");
    assert_eq!(s1.state, StepState::Queued);
    assert_eq!(s1.idempotency_key, "p1:s1");
    assert!(h.store.get_entry("p1", "s2").await.expect("get").is_none());

    let metadata = h.store.get_plan_metadata("p1").await.expect("get").expect("metadata");
    assert_eq!(metadata.next_step_index, 1);
    assert_eq!(metadata.last_completed_index, -1);

    assert_eq!(h.queue.depth(planq_core::PLAN_STEPS_QUEUE).await.expect("depth"), 1);
}

#[tokio::test]
async fn resubmitting_the_same_plan_changes_nothing() {
    let mut h = harness();
    let plan = two_step_plan("p1");
    let trace = TraceId::from_string("trc-a");
    h.manager.submit_plan_steps(&plan, trace.clone(), SubmitOptions::new()).await.expect("first");
    h.manager.submit_plan_steps(&plan, trace, SubmitOptions::new()).await.expect("second");

    let events = drain(&mut h.events);
    // One queued event; the in-flight entry short-circuits the second run.
    assert_eq!(states(&events), vec![("s1".to_string(), StepState::Queued)]);
    assert_eq!(h.queue.depth(planq_core::PLAN_STEPS_QUEUE).await.expect("depth"), 1);
}

#[tokio::test]
async fn blocking_policy_deny_fails_the_submit_cleanly() {
    let mut h = harness();
    // Subject with no scopes: missing_capability is a blocking deny.
    let subject = Subject::builder().user_id("u1").build();
    let err = h
        .manager
        .submit_plan_steps(
            &two_step_plan("p1"),
            TraceId::from_string("trc-a"),
            SubmitOptions::new().subject(subject),
        )
        .await;
    assert!(matches!(err, Err(EngineError::PolicyViolation(_))));

    // The plan did not partially start.
    assert!(h.store.get_plan_metadata("p1").await.expect("get").is_none());
    assert!(h.store.get_entry("p1", "s1").await.expect("get").is_none());
    assert!(h.store.list_active_steps().await.expect("list").is_empty());
    assert!(drain(&mut h.events).is_empty());
}

#[tokio::test]
async fn enqueue_failure_leaves_no_persisted_entry() {
    let mut h = harness();
    h.queue.close().await.expect("close");

    let err = h
        .manager
        .submit_plan_steps(&two_step_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await;
    assert!(matches!(err, Err(EngineError::Queue(_))));

    assert!(h.store.get_entry("p1", "s1").await.expect("get").is_none());
    assert!(h.registry.get("p1", "s1").is_none());
    assert!(drain(&mut h.events).is_empty());
    // The plan is recoverable by re-driving the release loop.
    assert!(h.store.get_plan_metadata("p1").await.expect("get").is_some());
}

// ── Approvals ────────────────────────────────────────────────────────────────

fn gated_plan(id: &str) -> Plan {
    Plan::builder()
        .id(id)
        .steps(vec![Step::builder().id("s1").approval_required(true).build()])
        .build()
}

#[tokio::test]
async fn approval_gated_step_parks() {
    let mut h = harness();
    h.manager
        .submit_plan_steps(&gated_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");

    let events = drain(&mut h.events);
    assert_eq!(states(&events), vec![("s1".to_string(), StepState::WaitingApproval)]);
    assert_eq!(events[0].step.summary.as_deref(), Some("Awaiting approval"));

    let entry = h.store.get_entry("p1", "s1").await.expect("get").expect("entry");
    assert_eq!(entry.state, StepState::WaitingApproval);
    assert_eq!(h.queue.depth(planq_core::PLAN_STEPS_QUEUE).await.expect("depth"), 0);
}

#[tokio::test]
async fn approving_dispatches_the_step() {
    let mut h = harness();
    h.manager
        .submit_plan_steps(&gated_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");
    drain(&mut h.events);

    h.manager
        .resolve_plan_step_approval("p1", "s1", ApprovalDecision::Approved, None)
        .await
        .expect("resolve");

    let events = drain(&mut h.events);
    assert_eq!(
        states(&events),
        vec![("s1".to_string(), StepState::Approved), ("s1".to_string(), StepState::Queued)]
    );
    // The approved event carries the merged approvals map.
    assert_eq!(
        events[0].step.approvals.as_ref().and_then(|a| a.get("repo.write")),
        Some(&true)
    );

    let entry = h.store.get_entry("p1", "s1").await.expect("get").expect("entry");
    assert_eq!(entry.state, StepState::Queued);
    assert_eq!(entry.approvals.get("repo.write"), Some(&true));
    assert_eq!(h.queue.depth(planq_core::PLAN_STEPS_QUEUE).await.expect("depth"), 1);
}

#[tokio::test]
async fn rejecting_tears_the_step_down() {
    let mut h = harness();
    h.manager
        .submit_plan_steps(&gated_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");
    drain(&mut h.events);

    h.manager
        .resolve_plan_step_approval(
            "p1",
            "s1",
            ApprovalDecision::Rejected,
            Some("not on my watch".to_string()),
        )
        .await
        .expect("resolve");

    let events = drain(&mut h.events);
    assert_eq!(states(&events), vec![("s1".to_string(), StepState::Rejected)]);
    assert_eq!(events[0].step.summary.as_deref(), Some("not on my watch"));

    assert!(h.store.get_entry("p1", "s1").await.expect("get").is_none());
    assert!(h.store.list_active_steps().await.expect("list").is_empty());
    assert!(h.registry.get("p1", "s1").is_none());
}

#[tokio::test]
async fn approval_with_surviving_blocking_deny_rejects() {
    // The capability is blocklisted at approval time: the re-check must
    // reject even though the human approved.
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = FakeClock::new();
    let store: Arc<dyn PlanStore> = Arc::new(
        FileStore::open_with_clock(dir.path().join("state.json"), clock.clone()).expect("store"),
    );
    let queue = BrokerQueue::new(Arc::new(MemoryDedupe::new()), Duration::from_secs(60), 4);
    let registry = Arc::new(HotRegistry::new());
    let bus = planq_core::EventBus::default();
    let mut events = bus.subscribe();
    let manager = PlanQueueManager::new(
        ManagerDeps {
            store: Arc::clone(&store),
            queue: Arc::new(queue),
            locks: Arc::new(LocalLockService::default()),
            policy: Arc::new(CapabilityPolicy::new().deny_capability("repo.write")),
            registry,
            bus,
            file_locks: None,
            clock,
        },
        ManagerOptions::default(),
    );

    // Parked steps can pre-exist in the store (another worker parked it).
    let step = Step::builder().id("s1").approval_required(true).build();
    store
        .remember_step(
            "p1",
            &step,
            &TraceId::from_string("trc-a"),
            planq_store::RememberStep {
                initial_state: StepState::WaitingApproval,
                idempotency_key: "p1:s1".to_string(),
                attempt: 0,
                created_at_ms: 0,
                request_id: Some(RequestId::from_string("req-a")),
                approvals: Default::default(),
                subject: None,
            },
        )
        .await
        .expect("remember");

    manager
        .resolve_plan_step_approval("p1", "s1", ApprovalDecision::Approved, None)
        .await
        .expect("resolve");

    let rejected = drain(&mut events);
    assert_eq!(states(&rejected), vec![("s1".to_string(), StepState::Rejected)]);
    assert!(store.get_entry("p1", "s1").await.expect("get").is_none());
}

#[tokio::test]
async fn resolving_an_unknown_step_errors() {
    let h = harness();
    let err = h
        .manager
        .resolve_plan_step_approval("ghost", "s1", ApprovalDecision::Approved, None)
        .await;
    assert!(matches!(err, Err(EngineError::UnknownStep { .. })));
}

// ── Completion application ───────────────────────────────────────────────────

#[tokio::test]
async fn completion_advances_the_cursor_and_dispatches_the_next_step() {
    let mut h = harness();
    h.manager
        .submit_plan_steps(&two_step_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");
    drain(&mut h.events);

    // The step consumer would have moved it to running.
    h.store.set_state("p1", "s1", StepState::Running, None, None, None).await.expect("running");
    h.manager
        .complete_step("p1", "s1", Some("ok".to_string()), None)
        .await
        .expect("complete");

    let events = drain(&mut h.events);
    assert_eq!(
        states(&events),
        vec![("s1".to_string(), StepState::Completed), ("s2".to_string(), StepState::Queued)]
    );

    assert!(h.store.get_entry("p1", "s1").await.expect("get").is_none());
    let metadata = h.store.get_plan_metadata("p1").await.expect("get").expect("metadata");
    assert_eq!(metadata.last_completed_index, 0);
    assert_eq!(metadata.next_step_index, 2);
}

#[tokio::test]
async fn finishing_the_last_step_forgets_the_plan_and_retains_the_subject() {
    let mut h = harness();
    let subject = Subject::builder()
        .user_id("u1")
        .session_id("sess-1")
        .scopes(["*".to_string()])
        .build();
    let plan = Plan::builder().id("p1").steps(vec![Step::builder().id("s1").build()]).build();
    h.manager
        .submit_plan_steps(
            &plan,
            TraceId::from_string("trc-a"),
            SubmitOptions::new().subject(subject.clone()),
        )
        .await
        .expect("submit");
    assert_eq!(h.registry.session_refcount("sess-1"), 1);
    drain(&mut h.events);

    h.store.set_state("p1", "s1", StepState::Running, None, None, None).await.expect("running");
    h.manager.complete_step("p1", "s1", None, None).await.expect("complete");

    assert!(h.store.get_plan_metadata("p1").await.expect("get").is_none());
    assert!(h.store.list_active_steps().await.expect("list").is_empty());
    assert_eq!(h.registry.session_refcount("sess-1"), 0);

    // The subject outlives the plan through the retained archive.
    assert_eq!(h.manager.get_plan_subject("p1").await.expect("subject"), Some(subject.clone()));
    assert_eq!(h.store.get_retained_subject("p1").await.expect("get"), Some(subject));
}

#[tokio::test]
async fn content_capture_gates_output_on_events() {
    // Capture off: output is dropped before store and bus.
    let mut h = harness();
    h.manager
        .submit_plan_steps(
            &Plan::builder().id("p1").steps(vec![Step::builder().id("s1").build()]).build(),
            TraceId::from_string("trc-a"),
            SubmitOptions::new(),
        )
        .await
        .expect("submit");
    drain(&mut h.events);
    h.store.set_state("p1", "s1", StepState::Running, None, None, None).await.expect("running");
    h.manager
        .complete_step("p1", "s1", None, Some(serde_json::json!({"text": "secret"})))
        .await
        .expect("complete");
    let events = drain(&mut h.events);
    assert!(events[0].step.output.is_none());

    // Capture on: output flows through.
    let mut h = harness_with(ManagerOptions { content_capture: true, ..Default::default() });
    h.manager
        .submit_plan_steps(
            &Plan::builder().id("p1").steps(vec![Step::builder().id("s1").build()]).build(),
            TraceId::from_string("trc-a"),
            SubmitOptions::new(),
        )
        .await
        .expect("submit");
    drain(&mut h.events);
    h.store.set_state("p1", "s1", StepState::Running, None, None, None).await.expect("running");
    h.manager
        .complete_step("p1", "s1", None, Some(serde_json::json!({"text": "visible"})))
        .await
        .expect("complete");
    let events = drain(&mut h.events);
    assert_eq!(events[0].step.output, Some(serde_json::json!({"text": "visible"})));
}

#[tokio::test]
async fn halt_forgets_the_step_and_does_not_advance() {
    let mut h = harness();
    h.manager
        .submit_plan_steps(&two_step_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");
    drain(&mut h.events);

    h.store.set_state("p1", "s1", StepState::Running, None, None, None).await.expect("running");
    h.manager
        .halt_step("p1", "s1", StepState::Failed, Some("tool exploded".to_string()))
        .await
        .expect("halt");

    let events = drain(&mut h.events);
    assert_eq!(states(&events), vec![("s1".to_string(), StepState::Failed)]);

    assert!(h.store.get_entry("p1", "s1").await.expect("get").is_none());
    // s2 was never dispatched and never will be: the cursor is stuck.
    assert!(h.store.get_entry("p1", "s2").await.expect("get").is_none());
    let metadata = h.store.get_plan_metadata("p1").await.expect("get").expect("metadata");
    assert_eq!(metadata.last_completed_index, -1);
}

// ── Rehydration ──────────────────────────────────────────────────────────────

async fn seed_entry(
    store: &Arc<dyn PlanStore>,
    plan_id: &str,
    step_id: &str,
    state: StepState,
    attempt: u32,
    subject: Option<Subject>,
) {
    let step = Step::builder().id(step_id).build();
    store
        .remember_step(
            plan_id,
            &step,
            &TraceId::from_string("trc-a"),
            planq_store::RememberStep {
                initial_state: state,
                idempotency_key: idempotency_key(plan_id, step_id),
                attempt,
                created_at_ms: 0,
                request_id: Some(RequestId::from_string("req-a")),
                approvals: Default::default(),
                subject,
            },
        )
        .await
        .expect("seed");
}

#[tokio::test]
async fn rehydration_restores_without_duplicating() {
    let mut h = harness();
    // waiting_approval, queued, and running entries survive a crash. The
    // running entry must persist through queued first to satisfy the
    // transition graph.
    seed_entry(&h.store, "p1", "s1", StepState::WaitingApproval, 0, None).await;
    seed_entry(&h.store, "p2", "s1", StepState::Queued, 0, None).await;
    seed_entry(&h.store, "p3", "s1", StepState::Queued, 1, None).await;
    h.store.set_state("p3", "s1", StepState::Running, None, None, None).await.expect("running");

    let restored = h.manager.rehydrate().await.expect("rehydrate");
    assert_eq!(restored, 3);

    let events = drain(&mut h.events);
    let mut by_plan: Vec<(String, StepState, Option<u32>, Option<String>)> = events
        .iter()
        .map(|e| {
            (e.plan_id.clone(), e.step.state, e.step.attempt, e.step.summary.clone())
        })
        .collect();
    by_plan.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(by_plan.len(), 2);
    // The parked step re-announces itself.
    assert_eq!(by_plan[0].0, "p1");
    assert_eq!(by_plan[0].1, StepState::WaitingApproval);
    assert_eq!(by_plan[0].3.as_deref(), Some("Awaiting approval (rehydrated)"));
    // The running step is re-enqueued as a retry.
    assert_eq!(by_plan[1].0, "p3");
    assert_eq!(by_plan[1].1, StepState::Queued);
    assert_eq!(by_plan[1].2, Some(1));
    assert!(by_plan[1].3.as_deref().unwrap_or("").contains("Retry enqueued"));

    // Two enqueues: the queued entry and the running entry. The parked
    // one stays off the queue.
    assert_eq!(h.queue.depth(planq_core::PLAN_STEPS_QUEUE).await.expect("depth"), 2);

    // Everything is back in the hot registry.
    assert!(h.registry.get("p1", "s1").is_some());
    assert!(h.registry.get("p2", "s1").is_some());
    assert!(h.registry.get("p3", "s1").is_some());
}

#[tokio::test]
async fn rehydration_counts_sessions_once_per_plan() {
    let h = harness();
    let subject = Subject::builder().session_id("sess-1").build();
    seed_entry(&h.store, "p1", "s1", StepState::Queued, 0, Some(subject.clone())).await;
    seed_entry(&h.store, "p1", "s2", StepState::WaitingApproval, 0, Some(subject.clone())).await;
    seed_entry(&h.store, "p2", "s1", StepState::Queued, 0, Some(subject)).await;

    h.manager.rehydrate().await.expect("rehydrate");
    // Two plans share the session: refcount 2, not 3.
    assert_eq!(h.registry.session_refcount("sess-1"), 2);
}

// ── Introspection ────────────────────────────────────────────────────────────

#[tokio::test]
async fn overview_lists_cursors() {
    let h = harness();
    h.manager
        .submit_plan_steps(&two_step_plan("p1"), TraceId::from_string("trc-a"), SubmitOptions::new())
        .await
        .expect("submit");

    let overview = h.manager.plan_overview().await.expect("overview");
    assert_eq!(overview.len(), 1);
    assert_eq!(overview[0].plan_id, "p1");
    assert_eq!(overview[0].next_step_index, 1);

    let entry = h
        .manager
        .get_persisted_plan_step("p1", "s1")
        .await
        .expect("get")
        .expect("entry");
    assert_eq!(entry.state, StepState::Queued);
}
