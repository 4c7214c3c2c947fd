// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const TTL: Duration = Duration::from_secs(5);

#[tokio::test]
async fn claim_is_set_if_absent() {
    let dedupe = MemoryDedupe::new();
    assert!(dedupe.claim("k1", TTL).await);
    assert!(!dedupe.claim("k1", TTL).await);
    assert!(dedupe.is_claimed("k1").await);
}

#[tokio::test]
async fn distinct_keys_are_independent() {
    let dedupe = MemoryDedupe::new();
    assert!(dedupe.claim("k1", TTL).await);
    assert!(dedupe.claim("k2", TTL).await);
}

#[tokio::test]
async fn release_frees_the_key() {
    let dedupe = MemoryDedupe::new();
    assert!(dedupe.claim("k1", TTL).await);
    dedupe.release("k1").await;
    assert!(!dedupe.is_claimed("k1").await);
    assert!(dedupe.claim("k1", TTL).await);
}

#[tokio::test]
async fn expired_claims_can_be_retaken() {
    let dedupe = MemoryDedupe::new();
    assert!(dedupe.claim("k1", Duration::from_millis(10)).await);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!dedupe.is_claimed("k1").await);
    assert!(dedupe.claim("k1", TTL).await);
}
