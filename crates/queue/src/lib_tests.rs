// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn dead_letter_queue_is_suffixed() {
    assert_eq!(dead_letter_queue("plan.steps"), "plan.steps.dead");
}

#[tokio::test]
async fn claim_gate_passes_without_key() {
    let dedupe = MemoryDedupe::new();
    let options = EnqueueOptions::new();
    assert!(claim_enqueue(&dedupe, std::time::Duration::from_secs(1), &options).await);
    // No key, so nothing was claimed.
    assert!(!dedupe.is_claimed("").await);
}

#[tokio::test]
async fn claim_gate_suppresses_second_enqueue() {
    let dedupe = MemoryDedupe::new();
    let ttl = std::time::Duration::from_secs(5);
    let options = EnqueueOptions::new().idempotency_key("p1:s1");
    assert!(claim_enqueue(&dedupe, ttl, &options).await);
    assert!(!claim_enqueue(&dedupe, ttl, &options).await);
}

#[tokio::test]
async fn skip_dedupe_bypasses_the_claim() {
    let dedupe = MemoryDedupe::new();
    let ttl = std::time::Duration::from_secs(5);
    let claimed = EnqueueOptions::new().idempotency_key("p1:s1");
    assert!(claim_enqueue(&dedupe, ttl, &claimed).await);

    let bypass = EnqueueOptions::new().idempotency_key("p1:s1").skip_dedupe(true);
    assert!(claim_enqueue(&dedupe, ttl, &bypass).await);
}

#[test]
fn message_header_lookup() {
    let mut hdrs = Headers::new();
    hdrs.insert(headers::TRACE_ID.into(), "trc-a".into());
    let msg = QueueMessage {
        id: "m1".into(),
        payload: serde_json::json!({}),
        headers: hdrs,
        attempts: 0,
    };
    assert_eq!(msg.header(headers::TRACE_ID), Some("trc-a"));
    assert_eq!(msg.header(headers::REQUEST_ID), None);
}
