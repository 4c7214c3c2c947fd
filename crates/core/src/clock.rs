// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wall and monotonic time behind one handle.
//!
//! Everything that stamps or ages a record — step `created_at`/`updated_at`
//! fields, retention cutoffs, RFC3339 event timestamps, cost durations —
//! goes through a [`Clock`], so tests steer time instead of sleeping.
//! `now()` is monotonic and feeds duration measurement; `epoch_ms()` is
//! wall time and feeds everything persisted.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Time source shared by the manager, consumers, and background sweeps.
/// Cloned into spawned tasks, hence the `'static` bound.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch.
    fn epoch_ms(&self) -> u64;
}

/// Production clock.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

struct FakeState {
    instant: Instant,
    epoch_ms: u64,
}

/// Deterministic clock for tests: time moves only when told to.
#[derive(Clone)]
pub struct FakeClock {
    state: Arc<Mutex<FakeState>>,
}

impl FakeClock {
    /// Starts at a fixed arbitrary epoch (1,000,000 ms).
    pub fn new() -> Self {
        Self::at(1_000_000)
    }

    /// Starts at the given epoch milliseconds.
    pub fn at(epoch_ms: u64) -> Self {
        Self { state: Arc::new(Mutex::new(FakeState { instant: Instant::now(), epoch_ms })) }
    }

    /// Move the monotonic and wall clocks forward together.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.instant += by;
        state.epoch_ms += by.as_millis() as u64;
    }

    /// Jump the wall clock without touching the monotonic one.
    pub fn set_epoch_ms(&self, epoch_ms: u64) {
        self.state.lock().epoch_ms = epoch_ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.state.lock().instant
    }

    fn epoch_ms(&self) -> u64 {
        self.state.lock().epoch_ms
    }
}

/// Format epoch milliseconds as an RFC3339 UTC timestamp, the form every
/// `plan.step` event carries in `occurred_at`.
pub fn rfc3339_ms(epoch_ms: u64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp_millis(epoch_ms as i64) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => String::from("1970-01-01T00:00:00.000Z"),
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
