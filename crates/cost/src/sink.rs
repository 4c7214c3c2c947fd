// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only JSONL sink for cost records.
//!
//! Writes frequently enough that cost data survives crashes; rotates the
//! file when it exceeds the size limit, keeping `.1` through `.3`.

use crate::CostMetrics;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Maximum metrics file size before rotation (10 MB).
const MAX_SINK_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated files to keep (costs.jsonl.1, .2, .3).
const MAX_ROTATED_FILES: u32 = 3;

pub struct JsonlSink {
    path: PathBuf,
    max_size: u64,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), max_size: MAX_SINK_SIZE }
    }

    #[cfg(test)]
    pub(crate) fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Best-effort append; a failing sink must never fail the operation
    /// being tracked.
    pub fn append(&self, record: &CostMetrics) {
        if let Err(e) = self.try_append(record) {
            tracing::warn!(error = %e, path = %self.path.display(), "cost sink write failed");
        }
    }

    fn try_append(&self, record: &CostMetrics) -> Result<(), std::io::Error> {
        self.rotate_if_needed();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }

    fn rotate_if_needed(&self) {
        let size = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        if size < self.max_size {
            return;
        }

        let path_str = self.path.display().to_string();
        for n in (1..MAX_ROTATED_FILES).rev() {
            let _ = fs::rename(format!("{path_str}.{n}"), format!("{path_str}.{}", n + 1));
        }
        let _ = fs::rename(&self.path, format!("{path_str}.1"));
    }
}

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;
