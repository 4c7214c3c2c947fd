// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator configuration.
//!
//! Loaded from TOML; every key has a serde default so an empty document is
//! a valid configuration.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which queue transport backs the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Broker,
    Log,
}

/// Which store backs persisted plan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStateBackend {
    #[default]
    File,
    Relational,
}

/// Where dedupe claims live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeBackend {
    #[default]
    Memory,
    Shared,
}

/// Where policy decision cache entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Shared,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    /// Total attempts before a retryable failure becomes terminal.
    pub retry_max_attempts: u32,
    pub retry_base_backoff_ms: u64,
    pub retry_backoff_cap_ms: u64,
    /// Concurrent in-flight messages per consumer.
    pub prefetch: usize,
    pub log: LogQueueConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            retry_max_attempts: 3,
            retry_base_backoff_ms: 1000,
            retry_backoff_cap_ms: 30_000,
            prefetch: 8,
            log: LogQueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogQueueConfig {
    pub data_dir: PathBuf,
    pub partitions: u32,
    pub replication: u32,
    pub auto_create_topics: bool,
}

impl Default for LogQueueConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("planq-log"),
            partitions: 4,
            replication: 1,
            auto_create_topics: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanStateConfig {
    pub backend: PlanStateBackend,
    /// File backend document path.
    pub path: PathBuf,
    /// Relational backend connection string.
    pub database_url: String,
    /// Terminal entries older than this are swept. 0 disables the sweep.
    pub retention_days: u32,
}

impl Default for PlanStateConfig {
    fn default() -> Self {
        Self {
            backend: PlanStateBackend::default(),
            path: PathBuf::from("planq-state.json"),
            database_url: String::from("sqlite::memory:"),
            retention_days: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub sweep_interval_secs: u64,
    pub content_capture: ContentCaptureConfig,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { sweep_interval_secs: 3600, content_capture: ContentCaptureConfig::default() }
    }
}

/// Gates whether tool output is persisted and forwarded on events.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContentCaptureConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub cache: PolicyCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyCacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub max_entries: usize,
    pub backend: CacheBackend,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self { enabled: false, ttl_seconds: 300, max_entries: 1024, backend: CacheBackend::Memory }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub backend: DedupeBackend,
    /// Claim lifetime; must exceed expected end-to-end processing time.
    pub ttl_ms: u64,
    pub redis_url: String,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            backend: DedupeBackend::Memory,
            ttl_ms: 300_000,
            redis_url: String::from("redis://127.0.0.1:6379"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Plan lock TTL; must exceed the worst-case cursor-advance critical
    /// section.
    pub ttl_ms: u64,
    pub acquire_timeout_ms: u64,
    pub redis_url: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            acquire_timeout_ms: 5_000,
            redis_url: String::from("redis://127.0.0.1:6379"),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub plan_state: PlanStateConfig,
    pub retention: RetentionConfig,
    pub policy: PolicyConfig,
    pub dedupe: DedupeConfig,
    pub lock: LockConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
