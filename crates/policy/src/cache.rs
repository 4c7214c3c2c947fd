// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Decision cache.
//!
//! Short-circuits repeated evaluations for a bounded TTL. Keys cover every
//! decision input: capability, subject fingerprint, tenant, and the
//! approvals map — so recording an approval naturally changes the key and
//! the cache never spans an approval boundary.

use crate::{PolicyContext, PolicyDecision, PolicyEnforcer};
use async_trait::async_trait;
use parking_lot::Mutex;
use planq_core::Step;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cache key over all decision inputs.
pub(crate) fn decision_key(step: &Step, ctx: &PolicyContext<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(step.capability.as_bytes());
    hasher.update([0]);
    if let Some(subject) = ctx.subject {
        hasher.update(subject.fingerprint().as_bytes());
        hasher.update([0]);
        if let Some(tenant) = &subject.tenant_id {
            hasher.update(tenant.as_bytes());
        }
    }
    hasher.update([0]);
    for (capability, value) in ctx.approvals {
        hasher.update(capability.as_bytes());
        hasher.update([u8::from(*value)]);
    }
    hasher.update([u8::from(step.approval_required)]);
    format!("{:x}", hasher.finalize())
}

/// Storage for cached decisions.
#[async_trait]
pub trait DecisionCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<PolicyDecision>;
    async fn put(&self, key: &str, decision: &PolicyDecision, ttl: Duration);
}

struct CacheSlot {
    decision: PolicyDecision,
    expires_at: Instant,
}

/// In-process decision cache with a max-entry cap.
pub struct MemoryDecisionCache {
    slots: Mutex<HashMap<String, CacheSlot>>,
    max_entries: usize,
}

impl MemoryDecisionCache {
    pub fn new(max_entries: usize) -> Self {
        Self { slots: Mutex::new(HashMap::new()), max_entries: max_entries.max(1) }
    }
}

#[async_trait]
impl DecisionCache for MemoryDecisionCache {
    async fn get(&self, key: &str) -> Option<PolicyDecision> {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => Some(slot.decision.clone()),
            Some(_) => {
                slots.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, decision: &PolicyDecision, ttl: Duration) {
        let mut slots = self.slots.lock();
        if slots.len() >= self.max_entries && !slots.contains_key(key) {
            // Cap the map by evicting expired slots, then arbitrary ones.
            let now = Instant::now();
            slots.retain(|_, slot| slot.expires_at > now);
            while slots.len() >= self.max_entries {
                let Some(victim) = slots.keys().next().cloned() else { break };
                slots.remove(&victim);
            }
        }
        slots.insert(
            key.to_string(),
            CacheSlot { decision: decision.clone(), expires_at: Instant::now() + ttl },
        );
    }
}

/// Shared decision cache over Redis. Best-effort: backend errors read as
/// cache misses.
pub struct RedisDecisionCache {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisDecisionCache {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn, prefix: String::from("planq:policy:") })
    }
}

#[async_trait]
impl DecisionCache for RedisDecisionCache {
    async fn get(&self, key: &str) -> Option<PolicyDecision> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{}{key}", self.prefix))
            .query_async(&mut conn)
            .await
            .ok()?;
        serde_json::from_str(&raw?).ok()
    }

    async fn put(&self, key: &str, decision: &PolicyDecision, ttl: Duration) {
        let Ok(raw) = serde_json::to_string(decision) else { return };
        let mut conn = self.conn.clone();
        let result: Result<(), _> = redis::cmd("SET")
            .arg(format!("{}{key}", self.prefix))
            .arg(raw)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "decision cache put failed");
        }
    }
}

/// Wraps an enforcer with a decision cache.
pub struct CachedEnforcer<E: PolicyEnforcer> {
    inner: E,
    cache: Arc<dyn DecisionCache>,
    ttl: Duration,
}

impl<E: PolicyEnforcer> CachedEnforcer<E> {
    pub fn new(inner: E, cache: Arc<dyn DecisionCache>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait]
impl<E: PolicyEnforcer> PolicyEnforcer for CachedEnforcer<E> {
    async fn enforce_plan_step(&self, step: &Step, ctx: &PolicyContext<'_>) -> PolicyDecision {
        let key = decision_key(step, ctx);
        if let Some(hit) = self.cache.get(&key).await {
            tracing::trace!(step_id = %step.id, "policy decision cache hit");
            return hit;
        }
        let decision = self.inner.enforce_plan_step(step, ctx).await;
        self.cache.put(&key, &decision, self.ttl).await;
        decision
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
