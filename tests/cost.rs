// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cost tracking wired into step execution, and anomaly detection.

use crate::prelude::*;
use planq_core::{StepState, SystemClock};
use planq_cost::{
    AnomalyKind, AttributionOptions, CostMetrics, CostTracker, PricingTable, Severity,
    TokenUsage,
};
use planq_engine::{
    RuntimeDeps, RuntimeOptions, SubmitOptions, ToolAgent, ToolEvent, ToolRun,
};
use planq_policy::CapabilityPolicy;
use planq_queue::{BrokerQueue, MemoryDedupe};
use planq_store::{FileStore, LocalLockService, PlanStore};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn tool_invocations_are_cost_tracked_per_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn PlanStore> =
        Arc::new(FileStore::open(dir.path().join("state.json")).expect("store"));
    let agent = Arc::new(planq_engine::FakeToolAgent::new());
    let tracker = Arc::new(CostTracker::new(PricingTable::default()));
    let runtime = planq_engine::Runtime::new(
        RuntimeDeps {
            store,
            queue: Arc::new(BrokerQueue::new(
                Arc::new(MemoryDedupe::new()),
                Duration::from_secs(60),
                4,
            )),
            locks: Arc::new(LocalLockService::default()),
            policy: Arc::new(CapabilityPolicy::new()),
            agent: Arc::clone(&agent) as Arc<dyn ToolAgent>,
            file_locks: None,
            cost: Some(Arc::clone(&tracker)),
            clock: SystemClock,
        },
        RuntimeOptions::default(),
    );

    let mut events = runtime.events();
    runtime.start().await.expect("start");

    agent.push_result(Ok(ToolRun(vec![ToolEvent::completed("ok")
        .usage(TokenUsage { prompt_tokens: 1000, completion_tokens: 500 })])));

    let step = planq_core::Step::builder()
        .id("s1")
        .metadata(serde_json::json!({"provider": "openai", "model": "gpt-4o"}))
        .build();
    runtime
        .manager()
        .submit_plan_steps(
            &plan("pc", vec![step]),
            trace("trc-c"),
            SubmitOptions::new(),
        )
        .await
        .expect("submit");
    wait_for_state(&mut events, "s1", StepState::Completed).await;

    let records = tracker.records_between(0, u64::MAX);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].plan_id.as_deref(), Some("pc"));
    assert_eq!(records[0].step_id.as_deref(), Some("s1"));
    assert_eq!(records[0].provider, "openai");
    assert_eq!(records[0].prompt_tokens, 1000);
    // gpt-4o: 1000 prompt at $0.0025/1k + 500 completion at $0.01/1k.
    assert!((records[0].cost_usd - 0.0075).abs() < 1e-9);
}

#[tokio::test]
async fn six_times_hourly_baseline_reports_a_critical_spike() {
    let tracker = CostTracker::new(PricingTable::default());
    for hour in 0..24u64 {
        let cost = if hour == 9 { 0.60 } else { 0.10 };
        tracker.record(CostMetrics {
            timestamp_ms: hour * 3_600_000,
            operation: "summarize".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            tenant_id: None,
            plan_id: None,
            step_id: None,
            prompt_tokens: 100,
            completion_tokens: 100,
            cost_usd: cost,
            duration_ms: 10,
            success: true,
        });
    }

    let report = tracker.attribute_costs(0, u64::MAX, AttributionOptions::default());
    let spike = report
        .anomalies
        .iter()
        .find(|a| a.kind == AnomalyKind::Spike)
        .expect("spike anomaly");
    assert_eq!(spike.severity, Severity::Critical);
    assert_eq!(spike.hour, Some(9));
}
