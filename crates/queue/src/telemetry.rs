// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue counters and depth gauges.
//!
//! Updated on every enqueue and disposition; snapshots are cheap clones for
//! operations surfaces.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Per-queue counters plus the current depth gauge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub dedupe_suppressed: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Pending-but-unacked work (consumer-group lag on the log backend).
    pub depth: u64,
}

#[derive(Default)]
struct TelemetryState {
    queues: HashMap<String, QueueCounters>,
    /// (topic, partition) -> lag, log backend only.
    partition_lag: HashMap<(String, u32), u64>,
}

/// Shared counter registry for one adapter instance.
#[derive(Clone, Default)]
pub struct QueueTelemetry {
    state: Arc<Mutex<TelemetryState>>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub queues: BTreeMap<String, QueueCounters>,
    pub partition_lag: BTreeMap<String, u64>,
}

impl QueueTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, queue: &str, f: impl FnOnce(&mut QueueCounters) -> R) -> R {
        let mut state = self.state.lock();
        f(state.queues.entry(queue.to_string()).or_default())
    }

    pub fn record_enqueue(&self, queue: &str) {
        self.with(queue, |c| {
            c.enqueued += 1;
            c.depth += 1;
        });
    }

    pub fn record_dedupe_suppressed(&self, queue: &str) {
        self.with(queue, |c| c.dedupe_suppressed += 1);
    }

    pub fn record_ack(&self, queue: &str) {
        self.with(queue, |c| {
            c.acked += 1;
            c.depth = c.depth.saturating_sub(1);
        });
    }

    /// A retry re-enqueues the payload; depth is unchanged.
    pub fn record_retry(&self, queue: &str) {
        self.with(queue, |c| c.retried += 1);
    }

    pub fn record_dead_letter(&self, queue: &str) {
        self.with(queue, |c| {
            c.dead_lettered += 1;
            c.depth = c.depth.saturating_sub(1);
        });
    }

    /// Log backend: depth is derived from offsets, not counted.
    pub fn set_depth(&self, queue: &str, depth: u64) {
        self.with(queue, |c| c.depth = depth);
    }

    pub fn set_partition_lag(&self, topic: &str, partition: u32, lag: u64) {
        let mut state = self.state.lock();
        state.partition_lag.insert((topic.to_string(), partition), lag);
    }

    pub fn depth(&self, queue: &str) -> u64 {
        self.state.lock().queues.get(queue).map(|c| c.depth).unwrap_or(0)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock();
        TelemetrySnapshot {
            queues: state.queues.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            partition_lag: state
                .partition_lag
                .iter()
                .map(|((topic, partition), lag)| (format!("{topic}/{partition}"), *lag))
                .collect(),
        }
    }
}

#[cfg(test)]
#[path = "telemetry_tests.rs"]
mod tests;
