// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::{headers, Disposition, EnqueueOptions, MemoryDedupe, QueueConsumer, QueueMessage};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;

const TTL: Duration = Duration::from_secs(30);

fn broker() -> BrokerQueue {
    BrokerQueue::new(Arc::new(MemoryDedupe::new()), TTL, 4)
}

struct ScriptedConsumer {
    script: Mutex<VecDeque<Disposition>>,
    tx: mpsc::UnboundedSender<QueueMessage>,
}

impl ScriptedConsumer {
    /// Plays `script` in order, then acks everything else.
    fn new(script: Vec<Disposition>) -> (Arc<Self>, mpsc::UnboundedReceiver<QueueMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { script: Mutex::new(script.into()), tx }), rx)
    }
}

#[async_trait]
impl QueueConsumer for ScriptedConsumer {
    async fn handle(&self, message: QueueMessage) -> Disposition {
        let _ = self.tx.send(message);
        self.script.lock().pop_front().unwrap_or(Disposition::Ack)
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<QueueMessage>) -> QueueMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("channel open")
}

// ── Delivery ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn enqueue_then_consume_acks() {
    let queue = broker();
    let (consumer, mut rx) = ScriptedConsumer::new(vec![]);
    queue.consume("work", consumer).await.expect("consume");

    queue
        .enqueue("work", serde_json::json!({"n": 1}), EnqueueOptions::new())
        .await
        .expect("enqueue");

    let message = recv(&mut rx).await;
    assert_eq!(message.payload["n"], 1);
    assert_eq!(message.attempts, 0);

    // Ack drains the depth gauge.
    for _ in 0..100 {
        if queue.depth("work").await.expect("depth") == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("depth never drained");
}

#[tokio::test]
async fn consume_before_enqueue_also_delivers() {
    let queue = broker();
    queue
        .enqueue("work", serde_json::json!({"n": 2}), EnqueueOptions::new())
        .await
        .expect("enqueue");

    let (consumer, mut rx) = ScriptedConsumer::new(vec![]);
    queue.consume("work", consumer).await.expect("consume");
    assert_eq!(recv(&mut rx).await.payload["n"], 2);
}

#[tokio::test]
async fn duplicate_idempotency_key_is_a_silent_noop() {
    let queue = broker();
    let (consumer, mut rx) = ScriptedConsumer::new(vec![]);
    queue.consume("work", consumer).await.expect("consume");

    let options = || EnqueueOptions::new().idempotency_key("p1:s1");
    queue.enqueue("work", serde_json::json!({"n": 1}), options()).await.expect("first");
    queue.enqueue("work", serde_json::json!({"n": 1}), options()).await.expect("second");

    recv(&mut rx).await;
    // Second delivery never arrives.
    let second = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(second.is_err(), "duplicate should be suppressed");
    assert_eq!(queue.telemetry().queues["work"].dedupe_suppressed, 1);
}

#[tokio::test]
async fn delayed_enqueue_arrives_later() {
    let queue = broker();
    let (consumer, mut rx) = ScriptedConsumer::new(vec![]);
    queue.consume("work", consumer).await.expect("consume");

    let start = Instant::now();
    queue
        .enqueue(
            "work",
            serde_json::json!({}),
            EnqueueOptions::new().delay(Duration::from_millis(60)),
        )
        .await
        .expect("enqueue");

    recv(&mut rx).await;
    assert!(start.elapsed() >= Duration::from_millis(50), "delivered too early");
}

// ── Retry / dead-letter ──────────────────────────────────────────────────────

#[tokio::test]
async fn retry_redelivers_with_incremented_attempts() {
    let queue = broker();
    let (consumer, mut rx) =
        ScriptedConsumer::new(vec![Disposition::Retry { delay: None }]);
    queue.consume("work", consumer).await.expect("consume");

    queue.enqueue("work", serde_json::json!({}), EnqueueOptions::new()).await.expect("enqueue");

    let first = recv(&mut rx).await;
    assert_eq!(first.attempts, 0);

    let second = recv(&mut rx).await;
    assert_eq!(second.attempts, 1);
    assert_eq!(second.header(headers::ATTEMPTS), Some("1"));
    assert_eq!(second.id, first.id);
}

#[tokio::test]
async fn dead_letter_routes_to_suffixed_queue_with_reason() {
    let queue = broker();
    let (consumer, _rx) = ScriptedConsumer::new(vec![Disposition::DeadLetter {
        reason: Some("mismatched_trace_or_idempotency".to_string()),
    }]);
    queue.consume("work", consumer).await.expect("consume");

    let (dead_consumer, mut dead_rx) = ScriptedConsumer::new(vec![]);
    queue.consume("work.dead", dead_consumer).await.expect("consume dead");

    queue.enqueue("work", serde_json::json!({"n": 9}), EnqueueOptions::new()).await.expect("enqueue");

    let dead = recv(&mut dead_rx).await;
    assert_eq!(dead.payload["n"], 9);
    assert_eq!(
        dead.header(headers::DEAD_LETTER_REASON),
        Some("mismatched_trace_or_idempotency")
    );
    assert_eq!(queue.telemetry().queues["work"].dead_lettered, 1);
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn second_consumer_is_rejected() {
    let queue = broker();
    let (first, _rx1) = ScriptedConsumer::new(vec![]);
    let (second, _rx2) = ScriptedConsumer::new(vec![]);
    queue.consume("work", first).await.expect("first consumer");
    let err = queue.consume("work", second).await;
    assert!(matches!(err, Err(QueueError::ConsumerExists(_))));
}

#[tokio::test]
async fn enqueue_after_close_fails() {
    let queue = broker();
    queue.close().await.expect("close");
    let err = queue.enqueue("work", serde_json::json!({}), EnqueueOptions::new()).await;
    assert!(matches!(err, Err(QueueError::Closed)));
}
