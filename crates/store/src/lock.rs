// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named mutexes with TTL.
//!
//! The plan queue manager serialises all mutations for one plan under
//! `plan:{plan_id}`. Lock expiry releases automatically so a crashed
//! holder cannot wedge a plan; the TTL must exceed the worst-case
//! cursor-advance critical section.

use crate::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Held lock; released on drop or explicit [`LockGuard::release`].
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Mutual exclusion across workers.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire `key` with automatic expiry after `ttl`. Waits up to the
    /// service's acquire timeout, then fails with [`StoreError::LockBusy`].
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, StoreError>;
}

struct Holder {
    token: u64,
    expires_at: Instant,
}

/// In-process named mutexes. Correct for single-node deployments where all
/// workers share the process.
pub struct LocalLockService {
    holders: Arc<Mutex<HashMap<String, Holder>>>,
    acquire_timeout: Duration,
    next_token: std::sync::atomic::AtomicU64,
}

impl LocalLockService {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            holders: Arc::new(Mutex::new(HashMap::new())),
            acquire_timeout,
            next_token: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn try_claim(&self, key: &str, ttl: Duration) -> Option<u64> {
        let mut holders = self.holders.lock();
        let now = Instant::now();
        match holders.get(key) {
            Some(holder) if holder.expires_at > now => None,
            _ => {
                let token =
                    self.next_token.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                holders.insert(key.to_string(), Holder { token, expires_at: now + ttl });
                Some(token)
            }
        }
    }
}

impl Default for LocalLockService {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl LockService for LocalLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, StoreError> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if let Some(token) = self.try_claim(key, ttl) {
                let holders = Arc::clone(&self.holders);
                let key = key.to_string();
                return Ok(LockGuard::new(move || {
                    let mut holders = holders.lock();
                    // Only the owning guard may release; an expired-and-
                    // reclaimed lock belongs to the new holder.
                    if holders.get(&key).is_some_and(|h| h.token == token) {
                        holders.remove(&key);
                    }
                }));
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockBusy(key.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Distributed named mutexes over Redis (`SET NX PX` with token-checked
/// release).
pub struct RedisLockService {
    conn: redis::aio::ConnectionManager,
    acquire_timeout: Duration,
    prefix: String,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

impl RedisLockService {
    pub async fn connect(url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { conn, acquire_timeout, prefix: String::from("planq:lock:") })
    }

    async fn try_claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{}{key}", self.prefix))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockService for RedisLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, StoreError> {
        let token = format!("{}-{}", std::process::id(), rand_token());
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if self.try_claim(key, &token, ttl).await? {
                let mut conn = self.conn.clone();
                let redis_key = format!("{}{key}", self.prefix);
                let token = token.clone();
                return Ok(LockGuard::new(move || {
                    // Release runs off-guard; expiry covers the failure path.
                    tokio::spawn(async move {
                        let script = redis::Script::new(RELEASE_SCRIPT);
                        let result: Result<i64, _> =
                            script.key(&redis_key).arg(&token).invoke_async(&mut conn).await;
                        if let Err(e) = result {
                            tracing::debug!(key = %redis_key, error = %e, "lock release failed");
                        }
                    });
                }));
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockBusy(key.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Process-local random token; uniqueness only has to hold among
/// concurrent holders of one key.
fn rand_token() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    (nanos << 20) | COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
