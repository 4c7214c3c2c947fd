// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use planq_core::FakeClock;
use std::time::Duration;

struct ToolOutput {
    usage: TokenUsage,
}

impl UsageCarrier for ToolOutput {
    fn usage(&self) -> Option<TokenUsage> {
        Some(self.usage)
    }
}

#[derive(Debug)]
struct ToolFailure;

fn tracker(clock: FakeClock) -> CostTracker<FakeClock> {
    CostTracker::with_clock(PricingTable::default(), clock)
}

#[tokio::test]
async fn tracks_duration_tokens_and_cost() {
    let clock = FakeClock::new();
    let tracker = tracker(clock.clone());

    let result: Result<ToolOutput, ToolFailure> = tracker
        .track_operation(
            OperationMetadata::new("summarize", "openai", "gpt-4o").tenant_id("acme"),
            async {
                clock.advance(Duration::from_millis(250));
                Ok(ToolOutput {
                    usage: TokenUsage { prompt_tokens: 1000, completion_tokens: 1000 },
                })
            },
        )
        .await;
    assert!(result.is_ok());

    let records = tracker.records_between(0, u64::MAX);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.operation, "summarize");
    assert_eq!(record.tenant_id.as_deref(), Some("acme"));
    assert_eq!(record.duration_ms, 250);
    assert_eq!(record.prompt_tokens, 1000);
    assert!((record.cost_usd - 0.0125).abs() < 1e-9);
    assert!(record.success);
}

#[tokio::test]
async fn failures_record_zero_usage() {
    let clock = FakeClock::new();
    let tracker = tracker(clock.clone());

    let result: Result<ToolOutput, ToolFailure> = tracker
        .track_operation(OperationMetadata::new("apply", "openai", "gpt-4o"), async {
            Err(ToolFailure)
        })
        .await;
    assert!(result.is_err());

    let records = tracker.records_between(0, u64::MAX);
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].prompt_tokens, 0);
    assert_eq!(records[0].cost_usd, 0.0);
}

#[tokio::test]
async fn records_between_filters_the_window() {
    let clock = FakeClock::new();
    clock.set_epoch_ms(10_000);
    let tracker = tracker(clock.clone());

    let _ = tracker
        .track_operation::<_, ToolFailure, _>(
            OperationMetadata::new("early", "openai", "gpt-4o"),
            async { Ok(ToolOutput { usage: TokenUsage::default() }) },
        )
        .await;

    clock.set_epoch_ms(20_000);
    let _ = tracker
        .track_operation::<_, ToolFailure, _>(
            OperationMetadata::new("late", "openai", "gpt-4o"),
            async { Ok(ToolOutput { usage: TokenUsage::default() }) },
        )
        .await;

    let window = tracker.records_between(15_000, 25_000);
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].operation, "late");
}

#[tokio::test]
async fn histogram_buckets_durations() {
    let clock = FakeClock::new();
    let tracker = tracker(clock.clone());

    for millis in [5u64, 80, 2_000] {
        let _ = tracker
            .track_operation::<_, ToolFailure, _>(
                OperationMetadata::new("op", "openai", "gpt-4o"),
                async {
                    clock.advance(Duration::from_millis(millis));
                    Ok(ToolOutput { usage: TokenUsage::default() })
                },
            )
            .await;
    }

    let histogram = tracker.histogram();
    assert_eq!(histogram.samples, 3);
    assert_eq!(histogram.counts[0], 1); // <=10ms
    assert_eq!(histogram.counts[2], 1); // <=100ms
    assert_eq!(histogram.counts[5], 1); // <=5000ms
}
