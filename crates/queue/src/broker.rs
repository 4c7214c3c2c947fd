// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker-style backend: per-queue FIFO with per-message disposition,
//! native delayed retry, and a native dead-letter queue.
//!
//! Queues live in-process; durability across restarts is provided by the
//! plan state store plus rehydration, not by the broker itself.

use crate::{
    claim_enqueue, dead_letter_queue, headers, DedupeService, Disposition, EnqueueOptions,
    QueueAdapter, QueueConsumer, QueueError, QueueMessage, QueueTelemetry, TelemetrySnapshot,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Delivery {
    id: String,
    payload: serde_json::Value,
    headers: crate::Headers,
    attempts: u32,
}

struct QueueChannel {
    tx: mpsc::UnboundedSender<Delivery>,
    /// Taken by the first consumer registration.
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl QueueChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

struct BrokerInner {
    dedupe: Arc<dyn DedupeService>,
    dedupe_ttl: Duration,
    prefetch: usize,
    telemetry: QueueTelemetry,
    queues: Mutex<HashMap<String, QueueChannel>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl BrokerInner {
    fn sender(&self, queue: &str) -> mpsc::UnboundedSender<Delivery> {
        let mut queues = self.queues.lock();
        queues.entry(queue.to_string()).or_insert_with(QueueChannel::new).tx.clone()
    }

    fn next_message_id(&self, queue: &str) -> String {
        format!("{queue}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// In-process broker backend.
#[derive(Clone)]
pub struct BrokerQueue {
    inner: Arc<BrokerInner>,
}

impl BrokerQueue {
    pub fn new(dedupe: Arc<dyn DedupeService>, dedupe_ttl: Duration, prefetch: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                dedupe,
                dedupe_ttl,
                prefetch: prefetch.max(1),
                telemetry: QueueTelemetry::new(),
                queues: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn send(&self, queue: &str, delivery: Delivery) -> Result<(), QueueError> {
        self.inner.sender(queue).send(delivery).map_err(|_| QueueError::Closed)?;
        self.inner.telemetry.record_enqueue(queue);
        Ok(())
    }
}

#[async_trait]
impl QueueAdapter for BrokerQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        if self.inner.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        if !claim_enqueue(self.inner.dedupe.as_ref(), self.inner.dedupe_ttl, &options).await {
            tracing::debug!(
                queue,
                idempotency_key = options.idempotency_key.as_deref(),
                "duplicate enqueue suppressed"
            );
            self.inner.telemetry.record_dedupe_suppressed(queue);
            return Ok(());
        }

        let delivery = Delivery {
            id: self.inner.next_message_id(queue),
            payload,
            headers: options.headers.clone(),
            attempts: 0,
        };

        match options.delay {
            Some(delay) if !delay.is_zero() => {
                let tx = self.inner.sender(queue);
                let telemetry = self.inner.telemetry.clone();
                let queue = queue.to_string();
                // Counted as pending immediately; it is work already owed.
                telemetry.record_enqueue(&queue);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(delivery);
                });
                Ok(())
            }
            _ => self.send(queue, delivery),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer: Arc<dyn QueueConsumer>,
    ) -> Result<(), QueueError> {
        let mut rx = {
            let mut queues = self.inner.queues.lock();
            let channel = queues.entry(queue.to_string()).or_insert_with(QueueChannel::new);
            channel.rx.take().ok_or_else(|| QueueError::ConsumerExists(queue.to_string()))?
        };

        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(inner.prefetch));
            loop {
                let delivery = tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    delivery = rx.recv() => match delivery {
                        Some(d) => d,
                        None => break,
                    },
                };

                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let consumer = Arc::clone(&consumer);
                let inner = Arc::clone(&inner);
                let queue = queue.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let message = QueueMessage {
                        id: delivery.id.clone(),
                        payload: delivery.payload.clone(),
                        headers: delivery.headers.clone(),
                        attempts: delivery.attempts,
                    };
                    match consumer.handle(message).await {
                        Disposition::Ack => inner.telemetry.record_ack(&queue),
                        Disposition::Retry { delay } => {
                            inner.telemetry.record_retry(&queue);
                            let attempts = delivery.attempts + 1;
                            let mut headers = delivery.headers;
                            headers.insert(headers::ATTEMPTS.into(), attempts.to_string());
                            let redelivery = Delivery {
                                id: delivery.id,
                                payload: delivery.payload,
                                headers,
                                attempts,
                            };
                            if let Some(delay) = delay {
                                tokio::time::sleep(delay).await;
                            }
                            let _ = inner.sender(&queue).send(redelivery);
                        }
                        Disposition::DeadLetter { reason } => {
                            inner.telemetry.record_dead_letter(&queue);
                            let dead = dead_letter_queue(&queue);
                            let mut headers = delivery.headers;
                            if let Some(reason) = &reason {
                                headers.insert(headers::DEAD_LETTER_REASON.into(), reason.clone());
                            }
                            tracing::warn!(
                                queue,
                                message_id = %delivery.id,
                                reason = reason.as_deref().unwrap_or("unspecified"),
                                "message dead-lettered"
                            );
                            let dead_delivery = Delivery {
                                id: delivery.id,
                                payload: delivery.payload,
                                headers,
                                attempts: delivery.attempts,
                            };
                            let _ = inner.sender(&dead).send(dead_delivery);
                            inner.telemetry.record_enqueue(&dead);
                        }
                    }
                });
            }
        });

        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.inner.telemetry.depth(queue))
    }

    fn telemetry(&self) -> TelemetrySnapshot {
        self.inner.telemetry.snapshot()
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
