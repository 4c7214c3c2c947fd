// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const TTL: Duration = Duration::from_secs(10);

#[tokio::test]
async fn acquire_then_release_allows_reacquire() {
    let locks = LocalLockService::new(Duration::from_millis(50));
    let guard = locks.acquire("plan:p1", TTL).await.expect("acquire");
    guard.release();
    locks.acquire("plan:p1", TTL).await.expect("reacquire");
}

#[tokio::test]
async fn drop_releases_the_lock() {
    let locks = LocalLockService::new(Duration::from_millis(50));
    {
        let _guard = locks.acquire("plan:p1", TTL).await.expect("acquire");
    }
    locks.acquire("plan:p1", TTL).await.expect("reacquire after drop");
}

#[tokio::test]
async fn contended_lock_times_out() {
    let locks = LocalLockService::new(Duration::from_millis(50));
    let _held = locks.acquire("plan:p1", TTL).await.expect("acquire");
    let err = locks.acquire("plan:p1", TTL).await;
    assert!(matches!(err, Err(StoreError::LockBusy(_))));
}

#[tokio::test]
async fn different_keys_do_not_contend() {
    let locks = LocalLockService::new(Duration::from_millis(50));
    let _a = locks.acquire("plan:p1", TTL).await.expect("acquire p1");
    let _b = locks.acquire("plan:p2", TTL).await.expect("acquire p2");
}

#[tokio::test]
async fn expired_lock_is_reclaimable() {
    let locks = LocalLockService::new(Duration::from_millis(200));
    let guard = locks.acquire("plan:p1", Duration::from_millis(20)).await.expect("acquire");
    // TTL elapses while the first holder is still alive.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _second = locks.acquire("plan:p1", TTL).await.expect("reclaim expired");
    // The stale guard's release must not free the new holder's lock.
    guard.release();
    let err = locks.acquire("plan:p1", TTL).await;
    assert!(matches!(err, Err(StoreError::LockBusy(_))));
}

#[tokio::test]
async fn waiter_gets_the_lock_when_freed_in_time() {
    let locks = Arc::new(LocalLockService::new(Duration::from_millis(500)));
    let guard = locks.acquire("plan:p1", TTL).await.expect("acquire");

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move { locks.acquire("plan:p1", TTL).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    guard.release();

    waiter.await.expect("join").expect("waiter acquires");
}
