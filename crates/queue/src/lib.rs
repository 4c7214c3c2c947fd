// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport-agnostic durable work queue.
//!
//! Two backends implement the same [`QueueAdapter`] contract: an in-process
//! broker ([`BrokerQueue`]) with native delayed retry and dead-letter
//! queues, and a file-backed partitioned log ([`LogQueue`]) with manual
//! offset commits. Delivery is at-least-once; exactly-once effect comes
//! from idempotency keys claimed through the [`DedupeService`].

mod broker;
mod dedupe;
mod log;
mod telemetry;

pub use broker::BrokerQueue;
pub use dedupe::{DedupeService, MemoryDedupe, RedisDedupe};
pub use log::{LogQueue, LogQueueOptions};
pub use telemetry::{QueueCounters, QueueTelemetry, TelemetrySnapshot};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Opaque string headers carried with every message.
pub type Headers = BTreeMap<String, String>;

/// Header names the orchestrator stores.
pub mod headers {
    pub const TRACE_ID: &str = "trace-id";
    pub const REQUEST_ID: &str = "request-id";
    pub const ATTEMPTS: &str = "x-attempts";
    pub const IDEMPOTENCY_KEY: &str = "x-idempotency-key";
    pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' already has a consumer")]
    ConsumerExists(String),
    #[error("topic '{0}' does not exist and auto-create is disabled")]
    TopicMissing(String),
    #[error("queue adapter is shut down")]
    Closed,
    #[error("payload serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("log io: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue backend: {0}")]
    Backend(String),
}

/// One delivered message.
///
/// `attempts` counts prior deliveries of this payload (0 on first delivery).
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub payload: serde_json::Value,
    pub headers: Headers,
    pub attempts: u32,
}

impl QueueMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// What the consumer decided about a delivery.
///
/// The handler returns exactly one disposition; the adapter acks, retries
/// with a delay, or routes to the dead-letter queue accordingly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry { delay: Option<Duration> },
    DeadLetter { reason: Option<String> },
}

/// Long-lived handler registered with [`QueueAdapter::consume`].
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Disposition;
}

/// Options for a single enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Claimed through the dedupe service; a failed claim makes the
    /// enqueue a silent no-op.
    pub idempotency_key: Option<String>,
    pub headers: Headers,
    pub delay: Option<Duration>,
    pub skip_dedupe: bool,
    /// Partition key for the log backend (defaults to the idempotency key).
    pub partition_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn skip_dedupe(mut self, skip: bool) -> Self {
        self.skip_dedupe = skip;
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

/// Durable work queue contract shared by both backends.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Enqueue a payload. At-least-once; duplicate suppression applies when
    /// an idempotency key is present and `skip_dedupe` is false.
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<(), QueueError>;

    /// Register the long-lived consumer for a queue.
    async fn consume(
        &self,
        queue: &str,
        consumer: Arc<dyn QueueConsumer>,
    ) -> Result<(), QueueError>;

    /// Pending-but-unacked work (consumer-group lag for the log backend).
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;

    /// Counters and gauges for this adapter.
    fn telemetry(&self) -> TelemetrySnapshot;

    /// Stop consumers and flush. Idempotent.
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Dead-letter destination for a queue or topic.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dead")
}

/// Shared enqueue-side dedupe gate. Returns false when the enqueue should
/// be suppressed.
pub(crate) async fn claim_enqueue(
    dedupe: &dyn DedupeService,
    ttl: Duration,
    options: &EnqueueOptions,
) -> bool {
    let Some(key) = options.idempotency_key.as_deref() else {
        return true;
    };
    if options.skip_dedupe {
        return true;
    }
    dedupe.claim(key, ttl).await
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
