// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-scoped filesystem advisory locks.
//!
//! Plans that mutate a shared workspace acquire file-level locks keyed by
//! their session. Locks are single-writer per file, re-entrant within a
//! session, and recorded in a manifest so they can be re-acquired after a
//! restart. Release happens when the session's last plan finishes.

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionLockError {
    #[error("file lock io: {0}")]
    Io(#[from] std::io::Error),
    #[error("file lock manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("'{path}' is locked by session '{holder}'")]
    Held { path: PathBuf, holder: String },
}

/// Durable record of which files each session holds.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    sessions: BTreeMap<String, BTreeSet<PathBuf>>,
}

struct SessionLocks {
    /// Lock-file handles; dropping a handle releases the advisory lock.
    files: HashMap<PathBuf, File>,
}

/// Refcounted advisory locks over a workspace directory.
pub struct FileLockManager {
    workspace: PathBuf,
    manifest_path: PathBuf,
    sessions: Mutex<HashMap<String, SessionLocks>>,
}

impl FileLockManager {
    pub fn new(workspace: impl Into<PathBuf>) -> Result<Self, SessionLockError> {
        let workspace = workspace.into();
        let state_dir = workspace.join(".planq");
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            manifest_path: state_dir.join("session-locks.json"),
            workspace,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn lock_path(&self, path: &Path) -> PathBuf {
        let mut name = path
            .strip_prefix(&self.workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "_");
        name.push_str(".flock");
        self.workspace.join(".planq").join(name)
    }

    fn load_manifest(&self) -> Result<Manifest, SessionLockError> {
        if !self.manifest_path.exists() {
            return Ok(Manifest::default());
        }
        let raw = std::fs::read_to_string(&self.manifest_path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<(), SessionLockError> {
        let tmp = self.manifest_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(manifest)?)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.manifest_path)?;
        Ok(())
    }

    fn holder_of(&self, path: &Path) -> Option<String> {
        let sessions = self.sessions.lock();
        sessions
            .iter()
            .find(|(_, locks)| locks.files.contains_key(path))
            .map(|(session, _)| session.clone())
    }

    /// Acquire the single-writer lock on `path` for `session_id`.
    /// Re-entrant: a second acquisition by the same session is a no-op.
    pub fn lock_file(&self, session_id: &str, path: &Path) -> Result<(), SessionLockError> {
        {
            let sessions = self.sessions.lock();
            if let Some(locks) = sessions.get(session_id) {
                if locks.files.contains_key(path) {
                    return Ok(());
                }
            }
        }

        let lock_path = self.lock_path(path);
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        file.try_lock_exclusive().map_err(|_| SessionLockError::Held {
            path: path.to_path_buf(),
            holder: self.holder_of(path).unwrap_or_else(|| String::from("another process")),
        })?;

        {
            let mut sessions = self.sessions.lock();
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionLocks { files: HashMap::new() })
                .files
                .insert(path.to_path_buf(), file);
        }

        let mut manifest = self.load_manifest()?;
        manifest.sessions.entry(session_id.to_string()).or_default().insert(path.to_path_buf());
        self.save_manifest(&manifest)?;

        tracing::debug!(session_id, path = %path.display(), "file lock acquired");
        Ok(())
    }

    /// Re-acquire every lock the manifest records for a session. Called at
    /// startup and on plan submission for an already-known session.
    pub fn restore_session_locks(&self, session_id: &str) -> Result<usize, SessionLockError> {
        let manifest = self.load_manifest()?;
        let Some(paths) = manifest.sessions.get(session_id) else {
            return Ok(0);
        };
        let paths: Vec<PathBuf> = paths.iter().cloned().collect();
        let mut restored = 0;
        for path in paths {
            self.lock_file(session_id, &path)?;
            restored += 1;
        }
        Ok(restored)
    }

    /// Drop every lock a session holds. Called when the session's plan
    /// refcount reaches zero or at shutdown.
    pub fn release_session_locks(&self, session_id: &str) -> Result<(), SessionLockError> {
        let removed = self.sessions.lock().remove(session_id);
        if let Some(locks) = removed {
            // Handles unlock on drop.
            drop(locks);
        }

        let mut manifest = self.load_manifest()?;
        if manifest.sessions.remove(session_id).is_some() {
            self.save_manifest(&manifest)?;
        }
        tracing::debug!(session_id, "session file locks released");
        Ok(())
    }

    /// Drop every held lock without touching the manifest, so a later
    /// restart can restore them. For orderly shutdown.
    pub fn release_all(&self) {
        let mut sessions = self.sessions.lock();
        let held = sessions.len();
        sessions.clear();
        if held > 0 {
            tracing::debug!(sessions = held, "released all session file locks");
        }
    }

    /// Files currently locked by a session.
    pub fn locked_paths(&self, session_id: &str) -> Vec<PathBuf> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|locks| locks.files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "flock_tests.rs"]
mod tests;
