// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core domain types for the planq orchestrator.
//!
//! Everything here is transport- and storage-agnostic: plans, steps,
//! subjects, the step lifecycle state machine, queue payloads, the plan
//! event bus, and configuration.

pub mod clock;
pub mod config;
pub mod event;
mod id;
pub mod macros;
mod plan;
mod state;
mod subject;
mod wire;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{
    CacheBackend, Config, ConfigError, DedupeBackend, PlanStateBackend, QueueBackend,
};
pub use event::{EventBus, EventStep, PlanStepEvent};
pub use id::{RequestId, TraceId};
pub use plan::{Plan, Step};
pub use state::{StepState, TransitionError};
pub use subject::Subject;
pub use wire::{idempotency_key, Completion, CompletionState, StepJob};

/// Queue carrying [`StepJob`] payloads.
pub const PLAN_STEPS_QUEUE: &str = "plan.steps";

/// Queue carrying [`Completion`] payloads.
pub const PLAN_COMPLETIONS_QUEUE: &str = "plan.completions";
