// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relational plan state backend.
//!
//! A small schema keyed `(plan_id)` for metadata and `(plan_id, step_id)`
//! for entries, with a unique secondary index on the idempotency key.
//! `remember_step` runs as a transactional upsert that re-checks the
//! transition rule before writing.

use crate::file::{advance_entry, new_entry};
use crate::{
    PersistedStepEntry, PlanMetadata, PlanStore, RememberStep, StoreError, SweepStats,
};
use async_trait::async_trait;
use planq_core::{Clock, RequestId, Step, StepState, Subject, SystemClock, TraceId};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS plan_metadata (\
        plan_id              TEXT PRIMARY KEY,\
        trace_id             TEXT NOT NULL,\
        request_id           TEXT NOT NULL,\
        steps                TEXT NOT NULL,\
        next_step_index      INTEGER NOT NULL,\
        last_completed_index INTEGER NOT NULL\
    )",
    "CREATE TABLE IF NOT EXISTS step_entries (\
        plan_id         TEXT NOT NULL,\
        step_id         TEXT NOT NULL,\
        idempotency_key TEXT NOT NULL,\
        state           TEXT NOT NULL,\
        attempt         INTEGER NOT NULL,\
        created_at_ms   INTEGER NOT NULL,\
        updated_at_ms   INTEGER NOT NULL,\
        trace_id        TEXT NOT NULL,\
        request_id      TEXT,\
        step            TEXT NOT NULL,\
        approvals       TEXT NOT NULL,\
        subject         TEXT,\
        summary         TEXT,\
        output          TEXT,\
        PRIMARY KEY (plan_id, step_id)\
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_step_entries_idempotency \
        ON step_entries (idempotency_key)",
    "CREATE TABLE IF NOT EXISTS retained_subjects (\
        plan_id        TEXT PRIMARY KEY,\
        subject        TEXT NOT NULL,\
        retained_at_ms INTEGER NOT NULL\
    )",
];

const TERMINAL_STATES: &str = "('completed', 'failed', 'rejected')";

/// SQLite-backed shared plan state.
pub struct SqliteStore<C: Clock = SystemClock> {
    pool: sqlx::SqlitePool,
    clock: C,
}

impl SqliteStore<SystemClock> {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_clock(url, SystemClock).await
    }
}

impl<C: Clock> SqliteStore<C> {
    pub async fn connect_with_clock(url: &str, clock: C) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect(url).await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, clock })
    }

    fn entry_from_row(row: &SqliteRow) -> Result<PersistedStepEntry, StoreError> {
        let state: String = row.try_get("state")?;
        let step: String = row.try_get("step")?;
        let approvals: String = row.try_get("approvals")?;
        let subject: Option<String> = row.try_get("subject")?;
        let output: Option<String> = row.try_get("output")?;
        let request_id: Option<String> = row.try_get("request_id")?;

        Ok(PersistedStepEntry {
            plan_id: row.try_get("plan_id")?,
            step: serde_json::from_str(&step)?,
            state: StepState::from_str(&state).map_err(StoreError::Backend)?,
            attempt: row.try_get::<i64, _>("attempt")? as u32,
            created_at_ms: row.try_get::<i64, _>("created_at_ms")? as u64,
            trace_id: TraceId::from_string(row.try_get::<String, _>("trace_id")?),
            request_id: request_id.map(RequestId::from_string),
            idempotency_key: row.try_get("idempotency_key")?,
            approvals: serde_json::from_str(&approvals)?,
            subject: subject.as_deref().map(serde_json::from_str).transpose()?,
            summary: row.try_get("summary")?,
            output: output.as_deref().map(serde_json::from_str).transpose()?,
            updated_at_ms: row.try_get::<i64, _>("updated_at_ms")? as u64,
        })
    }

    fn metadata_from_row(row: &SqliteRow) -> Result<PlanMetadata, StoreError> {
        let steps: String = row.try_get("steps")?;
        Ok(PlanMetadata {
            plan_id: row.try_get("plan_id")?,
            trace_id: TraceId::from_string(row.try_get::<String, _>("trace_id")?),
            request_id: RequestId::from_string(row.try_get::<String, _>("request_id")?),
            steps: serde_json::from_str(&steps)?,
            next_step_index: row.try_get::<i64, _>("next_step_index")? as usize,
            last_completed_index: row.try_get("last_completed_index")?,
        })
    }

    async fn write_entry(
        &self,
        entry: &PersistedStepEntry,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO step_entries \
             (plan_id, step_id, idempotency_key, state, attempt, created_at_ms, updated_at_ms, \
              trace_id, request_id, step, approvals, subject, summary, output) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (plan_id, step_id) DO UPDATE SET \
               state = excluded.state, attempt = excluded.attempt, \
               created_at_ms = excluded.created_at_ms, updated_at_ms = excluded.updated_at_ms, \
               request_id = excluded.request_id, approvals = excluded.approvals, \
               subject = excluded.subject, summary = excluded.summary, output = excluded.output",
        )
        .bind(&entry.plan_id)
        .bind(&entry.step.id)
        .bind(&entry.idempotency_key)
        .bind(entry.state.to_string())
        .bind(entry.attempt as i64)
        .bind(entry.created_at_ms as i64)
        .bind(entry.updated_at_ms as i64)
        .bind(entry.trace_id.as_str())
        .bind(entry.request_id.as_ref().map(|r| r.as_str().to_string()))
        .bind(serde_json::to_string(&entry.step)?)
        .bind(serde_json::to_string(&entry.approvals)?)
        .bind(entry.subject.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&entry.summary)
        .bind(entry.output.as_ref().map(serde_json::to_string).transpose()?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_entry(
        &self,
        plan_id: &str,
        step_id: &str,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<Option<PersistedStepEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM step_entries WHERE plan_id = ? AND step_id = ?")
            .bind(plan_id)
            .bind(step_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }
}

#[async_trait]
impl<C: Clock> PlanStore for SqliteStore<C> {
    async fn remember_plan_metadata(
        &self,
        plan_id: &str,
        metadata: PlanMetadata,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO plan_metadata \
             (plan_id, trace_id, request_id, steps, next_step_index, last_completed_index) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (plan_id) DO UPDATE SET \
               steps = excluded.steps, next_step_index = excluded.next_step_index, \
               last_completed_index = excluded.last_completed_index",
        )
        .bind(plan_id)
        .bind(metadata.trace_id.as_str())
        .bind(metadata.request_id.as_str())
        .bind(serde_json::to_string(&metadata.steps)?)
        .bind(metadata.next_step_index as i64)
        .bind(metadata.last_completed_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan_metadata(&self, plan_id: &str) -> Result<Option<PlanMetadata>, StoreError> {
        let row = sqlx::query("SELECT * FROM plan_metadata WHERE plan_id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::metadata_from_row).transpose()
    }

    async fn forget_plan_metadata(&self, plan_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM plan_metadata WHERE plan_id = ?")
            .bind(plan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_plan_metadata(&self) -> Result<Vec<PlanMetadata>, StoreError> {
        let rows = sqlx::query("SELECT * FROM plan_metadata ORDER BY plan_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::metadata_from_row).collect()
    }

    async fn remember_step(
        &self,
        plan_id: &str,
        step: &Step,
        trace_id: &TraceId,
        options: RememberStep,
    ) -> Result<(), StoreError> {
        let now_ms = self.clock.epoch_ms();
        let mut tx = self.pool.begin().await?;
        let entry = match self.load_entry(plan_id, &step.id, &mut tx).await? {
            Some(mut existing) => {
                advance_entry(&mut existing, &options, now_ms);
                existing
            }
            None => new_entry(plan_id, step, trace_id, options, now_ms),
        };
        self.write_entry(&entry, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_state(
        &self,
        plan_id: &str,
        step_id: &str,
        state: StepState,
        summary: Option<String>,
        output: Option<serde_json::Value>,
        attempt: Option<u32>,
    ) -> Result<(), StoreError> {
        let now_ms = self.clock.epoch_ms();
        let mut tx = self.pool.begin().await?;
        let mut entry = self.load_entry(plan_id, step_id, &mut tx).await?.ok_or_else(|| {
            StoreError::MissingEntry { plan_id: plan_id.to_string(), step_id: step_id.to_string() }
        })?;
        entry.state = entry.state.transition(state)?;
        if let Some(summary) = summary {
            entry.summary = Some(summary);
        }
        if let Some(output) = output {
            entry.output = Some(output);
        }
        if let Some(attempt) = attempt {
            entry.attempt = entry.attempt.max(attempt);
        }
        entry.updated_at_ms = now_ms;
        self.write_entry(&entry, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_entry(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<Option<PersistedStepEntry>, StoreError> {
        let row = sqlx::query("SELECT * FROM step_entries WHERE plan_id = ? AND step_id = ?")
            .bind(plan_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn forget_step(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM step_entries WHERE plan_id = ? AND step_id = ?")
            .bind(plan_id)
            .bind(step_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active_steps(&self) -> Result<Vec<PersistedStepEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM step_entries WHERE state NOT IN {TERMINAL_STATES} \
             ORDER BY plan_id, step_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn ensure_approvals(
        &self,
        plan_id: &str,
        step_id: &str,
    ) -> Result<BTreeMap<String, bool>, StoreError> {
        Ok(self.get_entry(plan_id, step_id).await?.map(|e| e.approvals).unwrap_or_default())
    }

    async fn record_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        capability: &str,
        value: bool,
    ) -> Result<(), StoreError> {
        let now_ms = self.clock.epoch_ms();
        let mut tx = self.pool.begin().await?;
        let mut entry = self.load_entry(plan_id, step_id, &mut tx).await?.ok_or_else(|| {
            StoreError::MissingEntry { plan_id: plan_id.to_string(), step_id: step_id.to_string() }
        })?;
        entry.approvals.insert(capability.to_string(), value);
        entry.updated_at_ms = now_ms;
        self.write_entry(&entry, &mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_approvals(&self, plan_id: &str, step_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE step_entries SET approvals = '{}', updated_at_ms = ? \
             WHERE plan_id = ? AND step_id = ?",
        )
        .bind(self.clock.epoch_ms() as i64)
        .bind(plan_id)
        .bind(step_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retain_subject(&self, plan_id: &str, subject: Subject) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO retained_subjects (plan_id, subject, retained_at_ms) VALUES (?, ?, ?) \
             ON CONFLICT (plan_id) DO UPDATE SET \
               subject = excluded.subject, retained_at_ms = excluded.retained_at_ms",
        )
        .bind(plan_id)
        .bind(serde_json::to_string(&subject)?)
        .bind(self.clock.epoch_ms() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_retained_subject(&self, plan_id: &str) -> Result<Option<Subject>, StoreError> {
        let row = sqlx::query("SELECT subject FROM retained_subjects WHERE plan_id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("subject")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn forget_retained_subject(&self, plan_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM retained_subjects WHERE plan_id = ?")
            .bind(plan_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep(&self, cutoff_ms: u64) -> Result<SweepStats, StoreError> {
        let entries = sqlx::query(&format!(
            "DELETE FROM step_entries WHERE state IN {TERMINAL_STATES} AND updated_at_ms < ?"
        ))
        .bind(cutoff_ms as i64)
        .execute(&self.pool)
        .await?;

        let subjects = sqlx::query("DELETE FROM retained_subjects WHERE retained_at_ms < ?")
            .bind(cutoff_ms as i64)
            .execute(&self.pool)
            .await?;

        Ok(SweepStats {
            entries_removed: entries.rows_affected(),
            subjects_removed: subjects.rows_affected(),
        })
    }
}

#[cfg(test)]
#[path = "relational_tests.rs"]
mod tests;
