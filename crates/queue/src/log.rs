// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Partitioned-log backend: append-only JSONL segments per
//! topic-partition with manual offset commits.
//!
//! Partitions are chosen by hashing the partition key, so everything for
//! one plan lands on one partition and per-plan ordering survives retries.
//! Offsets commit on ack only; retry re-appends the payload with
//! `attempts + 1`; the dead-letter topic is `<topic>.dead`. Depth is
//! latest-offset minus committed-offset summed across partitions.

use crate::{
    claim_enqueue, dead_letter_queue, headers, DedupeService, Disposition, EnqueueOptions,
    QueueAdapter, QueueConsumer, QueueError, QueueMessage, QueueTelemetry, TelemetrySnapshot,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Suffix marking state-holding topics that get log compaction applied.
const COMPACTED_SUFFIX: &str = ".state";

/// One appended record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    headers: crate::Headers,
    #[serde(default)]
    attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopicMeta {
    partitions: u32,
    replication: u32,
    /// Log compaction applies to state-holding topics. Advisory for the
    /// file backend; carried so operators see the same topology either way.
    compacted: bool,
}

struct Partition {
    path: PathBuf,
    /// Next offset to assign on append.
    next_offset: u64,
    /// Byte position the tailer has consumed up to.
    read_pos: u64,
}

impl Partition {
    fn open(path: PathBuf) -> Result<Self, QueueError> {
        let next_offset = match std::fs::File::open(&path) {
            Ok(file) => std::io::BufReader::new(file).lines().count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, next_offset, read_pos: 0 })
    }

    fn append(&mut self, record: &Record) -> Result<(), QueueError> {
        let line = serde_json::to_string(record)?;
        let mut file =
            std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        self.next_offset = record.offset + 1;
        Ok(())
    }

    /// Read complete records appended since the last call.
    fn read_new(&mut self) -> Result<Vec<Record>, QueueError> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(self.read_pos))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        let mut records = Vec::new();
        let mut consumed = 0usize;
        for line in buf.split_inclusive('\n') {
            if !line.ends_with('\n') {
                break; // partial write, pick it up next poll
            }
            consumed += line.len();
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(trimmed)?);
        }
        self.read_pos += consumed as u64;
        Ok(records)
    }
}

struct Topic {
    meta: TopicMeta,
    partitions: Vec<Mutex<Partition>>,
}

/// Committed offsets per topic per partition for one consumer group.
type CommittedOffsets = BTreeMap<String, BTreeMap<u32, u64>>;

/// Construction options for [`LogQueue`].
#[derive(Debug, Clone)]
pub struct LogQueueOptions {
    pub data_dir: PathBuf,
    pub partitions: u32,
    pub replication: u32,
    pub auto_create_topics: bool,
    /// Consumer group name used for offset commits.
    pub group: String,
    pub poll_interval: Duration,
}

impl LogQueueOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            partitions: 4,
            replication: 1,
            auto_create_topics: true,
            group: String::from("planq"),
            poll_interval: Duration::from_millis(25),
        }
    }

    pub fn from_config(config: &planq_core::config::LogQueueConfig) -> Self {
        let mut opts = Self::new(config.data_dir.clone());
        opts.partitions = config.partitions;
        opts.replication = config.replication;
        opts.auto_create_topics = config.auto_create_topics;
        opts
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn auto_create_topics(mut self, auto_create: bool) -> Self {
        self.auto_create_topics = auto_create;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

struct LogInner {
    opts: LogQueueOptions,
    dedupe: Arc<dyn DedupeService>,
    dedupe_ttl: Duration,
    telemetry: QueueTelemetry,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    offsets: Mutex<CommittedOffsets>,
    consumers: Mutex<HashSet<String>>,
    cancel: CancellationToken,
}

impl LogInner {
    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.opts.data_dir.join("topics").join(topic)
    }

    fn offsets_path(&self) -> PathBuf {
        self.opts.data_dir.join("offsets").join(format!("{}.json", self.opts.group))
    }

    /// Open or create a topic. Dead-letter topics are always created; all
    /// other missing topics respect the auto-create flag.
    fn topic(&self, name: &str) -> Result<Arc<Topic>, QueueError> {
        if let Some(topic) = self.topics.lock().get(name) {
            return Ok(Arc::clone(topic));
        }

        let dir = self.topic_dir(name);
        let meta_path = dir.join("meta.json");
        let meta = if meta_path.exists() {
            let raw = std::fs::read_to_string(&meta_path)?;
            serde_json::from_str(&raw)?
        } else {
            let allowed = self.opts.auto_create_topics || name.ends_with(".dead");
            if !allowed {
                return Err(QueueError::TopicMissing(name.to_string()));
            }
            let meta = TopicMeta {
                partitions: self.opts.partitions.max(1),
                replication: self.opts.replication.max(1),
                compacted: name.ends_with(COMPACTED_SUFFIX),
            };
            std::fs::create_dir_all(&dir)?;
            write_atomic(&meta_path, &serde_json::to_vec_pretty(&meta)?)?;
            meta
        };

        let mut partitions = Vec::with_capacity(meta.partitions as usize);
        for n in 0..meta.partitions {
            let partition = Partition::open(dir.join(format!("partition-{n}.jsonl")))?;
            partitions.push(Mutex::new(partition));
        }

        let topic = Arc::new(Topic { meta, partitions });
        self.topics.lock().insert(name.to_string(), Arc::clone(&topic));
        Ok(topic)
    }

    fn committed(&self, topic: &str, partition: u32) -> u64 {
        self.offsets
            .lock()
            .get(topic)
            .and_then(|parts| parts.get(&partition))
            .copied()
            .unwrap_or(0)
    }

    fn commit(&self, topic: &str, partition: u32, next: u64) -> Result<(), QueueError> {
        let snapshot = {
            let mut offsets = self.offsets.lock();
            offsets.entry(topic.to_string()).or_default().insert(partition, next);
            offsets.clone()
        };
        let path = self.offsets_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&path, &serde_json::to_vec_pretty(&snapshot)?)
    }

    fn append(
        &self,
        topic_name: &str,
        key: Option<String>,
        payload: serde_json::Value,
        headers: crate::Headers,
        attempts: u32,
    ) -> Result<(), QueueError> {
        let topic = self.topic(topic_name)?;
        let partition = partition_for(key.as_deref(), topic.meta.partitions);
        {
            let mut guard = topic.partitions[partition as usize].lock();
            let record = Record { offset: guard.next_offset, key, payload, headers, attempts };
            guard.append(&record)?;
        }
        self.telemetry.record_enqueue(topic_name);
        self.refresh_depth(topic_name, &topic);
        Ok(())
    }

    fn refresh_depth(&self, name: &str, topic: &Topic) {
        let mut total = 0;
        for (n, partition) in topic.partitions.iter().enumerate() {
            let latest = partition.lock().next_offset;
            let lag = latest.saturating_sub(self.committed(name, n as u32));
            self.telemetry.set_partition_lag(name, n as u32, lag);
            total += lag;
        }
        self.telemetry.set_depth(name, total);
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// FNV-1a over the partition key; stable so one plan maps to one partition.
fn partition_for(key: Option<&str>, partitions: u32) -> u32 {
    let Some(key) = key else { return 0 };
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

/// File-backed partitioned-log backend.
#[derive(Clone)]
pub struct LogQueue {
    inner: Arc<LogInner>,
}

impl LogQueue {
    pub fn open(
        opts: LogQueueOptions,
        dedupe: Arc<dyn DedupeService>,
        dedupe_ttl: Duration,
    ) -> Result<Self, QueueError> {
        std::fs::create_dir_all(opts.data_dir.join("topics"))?;
        std::fs::create_dir_all(opts.data_dir.join("offsets"))?;

        let inner = LogInner {
            opts,
            dedupe,
            dedupe_ttl,
            telemetry: QueueTelemetry::new(),
            topics: Mutex::new(HashMap::new()),
            offsets: Mutex::new(CommittedOffsets::new()),
            consumers: Mutex::new(HashSet::new()),
            cancel: CancellationToken::new(),
        };

        // Resume the group's committed offsets.
        let offsets_path = inner.offsets_path();
        if offsets_path.exists() {
            let raw = std::fs::read_to_string(&offsets_path)?;
            *inner.offsets.lock() = serde_json::from_str(&raw)?;
        }

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Deliver everything past the committed offset, one record at a time
    /// per partition so key ordering holds.
    async fn drain_partition(
        inner: &Arc<LogInner>,
        topic_name: &str,
        topic: &Arc<Topic>,
        partition: u32,
        consumer: &Arc<dyn QueueConsumer>,
    ) -> Result<(), QueueError> {
        let records = {
            let mut guard = topic.partitions[partition as usize].lock();
            guard.read_new()?
        };

        for record in records {
            if inner.cancel.is_cancelled() {
                return Ok(());
            }
            if record.offset < inner.committed(topic_name, partition) {
                continue; // already processed by a previous run of this group
            }

            let message = QueueMessage {
                id: format!("{topic_name}/{partition}@{}", record.offset),
                payload: record.payload.clone(),
                headers: record.headers.clone(),
                attempts: record.attempts,
            };

            match consumer.handle(message).await {
                Disposition::Ack => {
                    inner.telemetry.record_ack(topic_name);
                }
                Disposition::Retry { delay } => {
                    inner.telemetry.record_retry(topic_name);
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let attempts = record.attempts + 1;
                    let mut retry_headers = record.headers.clone();
                    retry_headers.insert(headers::ATTEMPTS.into(), attempts.to_string());
                    inner.append(
                        topic_name,
                        record.key.clone(),
                        record.payload.clone(),
                        retry_headers,
                        attempts,
                    )?;
                }
                Disposition::DeadLetter { reason } => {
                    inner.telemetry.record_dead_letter(topic_name);
                    let mut dead_headers = record.headers.clone();
                    if let Some(reason) = &reason {
                        dead_headers.insert(headers::DEAD_LETTER_REASON.into(), reason.clone());
                    }
                    tracing::warn!(
                        topic = topic_name,
                        partition,
                        offset = record.offset,
                        reason = reason.as_deref().unwrap_or("unspecified"),
                        "record dead-lettered"
                    );
                    inner.append(
                        &dead_letter_queue(topic_name),
                        record.key.clone(),
                        record.payload.clone(),
                        dead_headers,
                        record.attempts,
                    )?;
                }
            }

            // Offsets commit only after a disposition is applied.
            inner.commit(topic_name, partition, record.offset + 1)?;
            inner.refresh_depth(topic_name, topic);
        }

        Ok(())
    }
}

#[async_trait]
impl QueueAdapter for LogQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        if self.inner.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        // Topic existence (and the auto-create gate) applies even to
        // suppressed enqueues.
        self.inner.topic(queue)?;

        if !claim_enqueue(self.inner.dedupe.as_ref(), self.inner.dedupe_ttl, &options).await {
            tracing::debug!(
                topic = queue,
                idempotency_key = options.idempotency_key.as_deref(),
                "duplicate publish suppressed"
            );
            self.inner.telemetry.record_dedupe_suppressed(queue);
            return Ok(());
        }

        if let Some(delay) = options.delay {
            tokio::time::sleep(delay).await;
        }

        let key = options.partition_key.clone().or_else(|| options.idempotency_key.clone());
        self.inner.append(queue, key, payload, options.headers, 0)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer: Arc<dyn QueueConsumer>,
    ) -> Result<(), QueueError> {
        self.inner.topic(queue)?;
        if !self.inner.consumers.lock().insert(queue.to_string()) {
            return Err(QueueError::ConsumerExists(queue.to_string()));
        }

        let inner = Arc::clone(&self.inner);
        let topic_name = queue.to_string();
        tokio::spawn(async move {
            loop {
                if inner.cancel.is_cancelled() {
                    break;
                }
                let topic = match inner.topic(&topic_name) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(topic = %topic_name, error = %e, "poll failed");
                        break;
                    }
                };
                for n in 0..topic.meta.partitions {
                    if let Err(e) =
                        Self::drain_partition(&inner, &topic_name, &topic, n, &consumer).await
                    {
                        tracing::warn!(
                            topic = %topic_name,
                            partition = n,
                            error = %e,
                            "partition drain failed"
                        );
                    }
                }
                inner.refresh_depth(&topic_name, &topic);
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(inner.opts.poll_interval) => {}
                }
            }
        });

        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let topic = match self.inner.topic(queue) {
            Ok(t) => t,
            Err(QueueError::TopicMissing(_)) => return Ok(0),
            Err(e) => return Err(e),
        };
        self.inner.refresh_depth(queue, &topic);
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
#[path = "log_tests.rs"]
mod tests;
