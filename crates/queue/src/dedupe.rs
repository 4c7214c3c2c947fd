// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idempotency-key claims with a bounded TTL.
//!
//! Duplicate suppression is an optimisation, not a correctness requirement:
//! if the backing store is unreachable, `claim` fails open so the pipeline
//! never stalls. Correctness is guaranteed by idempotent state transitions
//! keyed on the same key.

use crate::QueueError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Atomic set-if-absent claims with expiry.
#[async_trait]
pub trait DedupeService: Send + Sync {
    /// Claim `key` for `ttl`. Returns false when already claimed.
    async fn claim(&self, key: &str, ttl: Duration) -> bool;

    /// Best-effort early release.
    async fn release(&self, key: &str);

    async fn is_claimed(&self, key: &str) -> bool;

    async fn close(&self) {}
}

/// In-process dedupe map. Suitable for single-node deployments.
#[derive(Default)]
pub struct MemoryDedupe {
    claims: Mutex<HashMap<String, Instant>>,
}

impl MemoryDedupe {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(claims: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        claims.retain(|_, expires| *expires > now);
    }
}

#[async_trait]
impl DedupeService for MemoryDedupe {
    async fn claim(&self, key: &str, ttl: Duration) -> bool {
        let mut claims = self.claims.lock();
        Self::sweep(&mut claims);
        if claims.contains_key(key) {
            return false;
        }
        claims.insert(key.to_string(), Instant::now() + ttl);
        true
    }

    async fn release(&self, key: &str) {
        self.claims.lock().remove(key);
    }

    async fn is_claimed(&self, key: &str) -> bool {
        let mut claims = self.claims.lock();
        Self::sweep(&mut claims);
        claims.contains_key(key)
    }
}

/// Shared dedupe store over Redis (`SET NX PX`).
pub struct RedisDedupe {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisDedupe {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(|e| QueueError::Backend(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(Self { conn, prefix: String::from("planq:dedupe:") })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl DedupeService for RedisDedupe {
    async fn claim(&self, key: &str, ttl: Duration) -> bool {
        let mut conn = self.conn.clone();
        let result: Result<Option<String>, _> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                // Fail open: a dead dedupe store must not stall the pipeline.
                tracing::warn!(key, error = %e, "dedupe claim unavailable, allowing enqueue");
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: Result<u64, _> =
            redis::cmd("DEL").arg(self.key(key)).query_async(&mut conn).await;
        if let Err(e) = result {
            tracing::debug!(key, error = %e, "dedupe release failed");
        }
    }

    async fn is_claimed(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        let result: Result<bool, _> =
            redis::cmd("EXISTS").arg(self.key(key)).query_async(&mut conn).await;
        result.unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "dedupe_tests.rs"]
mod tests;
