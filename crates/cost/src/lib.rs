// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cost tracking for tool invocations.
//!
//! [`CostTracker::track_operation`] wraps an invocation, measures wall
//! time, extracts token usage from the result, prices it from a static
//! `(provider, model)` table, and appends a [`CostMetrics`] record to a
//! bounded in-memory ring plus an optional JSONL sink with size rotation.
//! [`attribution`] turns the ring into per-tenant / per-operation /
//! per-hour reports with anomaly detection.

pub mod attribution;
mod pricing;
mod sink;

pub use attribution::{
    AnomalyKind, AttributionOptions, CostAnomaly, CostAttributionReport, CostRecommendation,
    RecommendationKind, Severity,
};
pub use pricing::{Pricing, PricingTable};
pub use sink::JsonlSink;

use parking_lot::Mutex;
use planq_core::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;

/// Default cap on the in-memory metrics ring.
const DEFAULT_RING_CAPACITY: usize = 100_000;

/// Histogram bucket upper bounds in milliseconds (last bucket is +inf).
const DURATION_BUCKETS_MS: [u64; 7] = [10, 50, 100, 500, 1_000, 5_000, 10_000];

/// Token counts extracted from a tool invocation result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Results that can report their token usage.
pub trait UsageCarrier {
    fn usage(&self) -> Option<TokenUsage>;
}

/// Identifies the operation being tracked.
#[derive(Debug, Clone, Default)]
pub struct OperationMetadata {
    pub operation: String,
    pub provider: String,
    pub model: String,
    pub tenant_id: Option<String>,
    pub plan_id: Option<String>,
    pub step_id: Option<String>,
}

impl OperationMetadata {
    pub fn new(
        operation: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            provider: provider.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn plan_id(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// One recorded tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    pub timestamp_ms: u64,
    pub operation: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub success: bool,
}

/// Duration histogram counts per bucket (the last bucket is unbounded).
#[derive(Debug, Clone, Default, Serialize)]
pub struct DurationHistogram {
    pub counts: [u64; DURATION_BUCKETS_MS.len() + 1],
    pub samples: u64,
}

impl DurationHistogram {
    fn record(&mut self, duration_ms: u64) {
        let bucket = DURATION_BUCKETS_MS
            .iter()
            .position(|&bound| duration_ms <= bound)
            .unwrap_or(DURATION_BUCKETS_MS.len());
        self.counts[bucket] += 1;
        self.samples += 1;
    }
}

struct TrackerState {
    records: VecDeque<CostMetrics>,
    histogram: DurationHistogram,
}

/// Records cost and duration for every tool invocation.
pub struct CostTracker<C: Clock = SystemClock> {
    clock: C,
    pricing: PricingTable,
    state: Mutex<TrackerState>,
    ring_capacity: usize,
    sink: Option<JsonlSink>,
}

impl CostTracker<SystemClock> {
    pub fn new(pricing: PricingTable) -> Self {
        Self::with_clock(pricing, SystemClock)
    }
}

impl<C: Clock> CostTracker<C> {
    pub fn with_clock(pricing: PricingTable, clock: C) -> Self {
        Self {
            clock,
            pricing,
            state: Mutex::new(TrackerState {
                records: VecDeque::new(),
                histogram: DurationHistogram::default(),
            }),
            ring_capacity: DEFAULT_RING_CAPACITY,
            sink: None,
        }
    }

    /// Also append every record to a JSONL file with size rotation.
    pub fn with_sink(mut self, sink: JsonlSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Wrap a tool invocation, recording wall time, tokens, and cost.
    /// The result passes through untouched.
    pub async fn track_operation<T, E, F>(
        &self,
        metadata: OperationMetadata,
        operation: F,
    ) -> Result<T, E>
    where
        T: UsageCarrier,
        F: Future<Output = Result<T, E>>,
    {
        let started = self.clock.now();
        let timestamp_ms = self.clock.epoch_ms();
        let result = operation.await;
        let duration_ms = self.clock.now().duration_since(started).as_millis() as u64;

        let usage = result.as_ref().ok().and_then(UsageCarrier::usage).unwrap_or_default();
        let cost_usd = self.pricing.cost(&metadata.provider, &metadata.model, usage);

        let record = CostMetrics {
            timestamp_ms,
            operation: metadata.operation,
            provider: metadata.provider,
            model: metadata.model,
            tenant_id: metadata.tenant_id,
            plan_id: metadata.plan_id,
            step_id: metadata.step_id,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_usd,
            duration_ms,
            success: result.is_ok(),
        };

        self.record(record);
        result
    }

    /// Append a pre-built record (streamed results, tests).
    pub fn record(&self, record: CostMetrics) {
        if let Some(sink) = &self.sink {
            sink.append(&record);
        }
        let mut state = self.state.lock();
        state.histogram.record(record.duration_ms);
        state.records.push_back(record);
        while state.records.len() > self.ring_capacity {
            state.records.pop_front();
        }
    }

    /// Records inside `[start_ms, end_ms)`.
    pub fn records_between(&self, start_ms: u64, end_ms: u64) -> Vec<CostMetrics> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.timestamp_ms >= start_ms && r.timestamp_ms < end_ms)
            .cloned()
            .collect()
    }

    pub fn histogram(&self) -> DurationHistogram {
        self.state.lock().histogram.clone()
    }

    /// Per-tenant / per-operation / per-provider / per-hour / per-day
    /// attribution with anomaly detection and recommendations.
    pub fn attribute_costs(
        &self,
        start_ms: u64,
        end_ms: u64,
        options: AttributionOptions,
    ) -> CostAttributionReport {
        attribution::attribute(
            &self.records_between(start_ms, end_ms),
            &self.pricing,
            start_ms,
            end_ms,
            options,
        )
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
