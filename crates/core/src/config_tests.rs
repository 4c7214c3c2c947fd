// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn empty_document_uses_defaults() {
    let config = Config::from_toml_str("").expect("parse");
    assert_eq!(config.queue.backend, QueueBackend::Broker);
    assert_eq!(config.queue.retry_max_attempts, 3);
    assert_eq!(config.queue.retry_base_backoff_ms, 1000);
    assert_eq!(config.plan_state.backend, PlanStateBackend::File);
    assert_eq!(config.plan_state.retention_days, 0);
    assert!(!config.retention.content_capture.enabled);
    assert!(!config.policy.cache.enabled);
    assert_eq!(config.dedupe.backend, DedupeBackend::Memory);
    assert_eq!(config.lock.ttl_ms, 30_000);
}

#[test]
fn overrides_apply() {
    let raw = r#"
[queue]
backend = "log"
retry_max_attempts = 5

[queue.log]
partitions = 8
auto_create_topics = false

[plan_state]
backend = "relational"
database_url = "sqlite://planq.db"
retention_days = 14

[retention.content_capture]
enabled = true

[policy.cache]
enabled = true
ttl_seconds = 60
backend = "shared"

[dedupe]
backend = "shared"
ttl_ms = 60000
"#;
    let config = Config::from_toml_str(raw).expect("parse");
    assert_eq!(config.queue.backend, QueueBackend::Log);
    assert_eq!(config.queue.retry_max_attempts, 5);
    assert_eq!(config.queue.log.partitions, 8);
    assert!(!config.queue.log.auto_create_topics);
    assert_eq!(config.plan_state.backend, PlanStateBackend::Relational);
    assert_eq!(config.plan_state.retention_days, 14);
    assert!(config.retention.content_capture.enabled);
    assert!(config.policy.cache.enabled);
    assert_eq!(config.policy.cache.backend, CacheBackend::Shared);
    assert_eq!(config.dedupe.backend, DedupeBackend::Shared);
    assert_eq!(config.dedupe.ttl_ms, 60_000);
}

#[test]
fn unknown_backend_is_an_error() {
    let err = Config::from_toml_str("[queue]\nbackend = \"rabbit\"\n");
    assert!(err.is_err());
}
