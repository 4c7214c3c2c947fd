// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The plan execution engine.
//!
//! [`PlanQueueManager`] owns the plan state machine: it submits plans,
//! advances cursors under the distributed plan lock, parks steps behind
//! approvals, and resolves them. [`StepConsumer`] executes dispatched
//! steps through the tool agent with retry and backoff;
//! [`CompletionConsumer`] applies completions and drives the next step.
//! [`Runtime`] wires the three together and rehydrates in-flight state at
//! startup.

mod agent;
mod completion_consumer;
mod error;
mod manager;
mod registry;
mod runtime;
mod step_consumer;

pub use agent::{ToolAgent, ToolAgentError, ToolEvent, ToolEventState, ToolInvocation, ToolRun};
pub use completion_consumer::CompletionConsumer;
pub use error::EngineError;
pub use manager::{ApprovalDecision, ManagerDeps, ManagerOptions, PlanQueueManager, SubmitOptions};
pub use registry::{HotRegistry, RegistryEntry};
pub use runtime::{Runtime, RuntimeDeps, RuntimeOptions};
pub use step_consumer::{retry_backoff, StepConsumer, StepConsumerOptions};

#[cfg(any(test, feature = "test-support"))]
pub use agent::FakeToolAgent;
