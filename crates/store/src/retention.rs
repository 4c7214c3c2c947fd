// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background retention sweep.

use crate::{PlanStore, SweepStats};
use planq_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Periodically removes terminal step entries older than the configured
/// age and prunes the retained-subject archive. `waiting_approval` entries
/// are exempt regardless of age.
pub struct RetentionSweeper<C: Clock> {
    store: Arc<dyn PlanStore>,
    clock: C,
    retention_days: u32,
}

impl<C: Clock> RetentionSweeper<C> {
    pub fn new(store: Arc<dyn PlanStore>, clock: C, retention_days: u32) -> Self {
        Self { store, clock, retention_days }
    }

    /// One sweep pass. No-op when retention is disabled (0 days).
    pub async fn run_once(&self) -> SweepStats {
        if self.retention_days == 0 {
            return SweepStats::default();
        }
        let cutoff_ms =
            self.clock.epoch_ms().saturating_sub(u64::from(self.retention_days) * DAY_MS);
        match self.store.sweep(cutoff_ms).await {
            Ok(stats) => {
                if stats.entries_removed > 0 || stats.subjects_removed > 0 {
                    tracing::info!(
                        entries = stats.entries_removed,
                        subjects = stats.subjects_removed,
                        "retention sweep removed aged records"
                    );
                }
                stats
            }
            Err(e) => {
                tracing::warn!(error = %e, "retention sweep failed");
                SweepStats::default()
            }
        }
    }

    /// Spawn the periodic sweep task.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) {
        if self.retention_days == 0 {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                self.run_once().await;
            }
        });
    }
}

#[cfg(test)]
#[path = "retention_tests.rs"]
mod tests;
