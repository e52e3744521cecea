//! The completion rendezvous.
//!
//! A marker file is the ground truth. In-process publishers also wake
//! waiters through a `Notify`; the bounded poll interval picks up markers
//! written by other processes (`foreman publish`).
//!
//! Gate calls do blocking file I/O. Async callers go through
//! `spawn_blocking` (see `dispatch::publish_blocking`).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::GateError;
use crate::gate::{GateOutcome, MARKER_CONTENT, MarkerKey, Outcome, complete_dir};

/// Shared between the dispatcher and worker harnesses, usually behind an `Arc`.
#[derive(Debug)]
pub struct CompletionGate {
    loops_root: PathBuf,
    poll_interval: Duration,
    notify: Notify,
}

impl CompletionGate {
    pub fn new(loops_root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            loops_root: loops_root.into(),
            poll_interval,
            notify: Notify::new(),
        }
    }

    pub fn loops_root(&self) -> &Path {
        &self.loops_root
    }

    /// Reserve `key` for this publisher. Exactly one caller, in any
    /// process and for either outcome, gets `true`.
    pub fn claim(&self, key: &MarkerKey) -> Result<bool, GateError> {
        let dir = key.dir(&self.loops_root);
        fs::create_dir_all(&dir).map_err(|source| GateError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = key.claim_path(&self.loops_root);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!(key = %key, "Key claimed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(GateError::Io { path, source }),
        }
    }

    /// Write the marker for a key this caller has claimed and wake waiters.
    pub fn commit(&self, key: &MarkerKey, outcome: Outcome) -> Result<(), GateError> {
        let path = key.path(&self.loops_root, outcome);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            // Written outside the claim protocol
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(GateError::AlreadyPublished {
                    key: key.clone(),
                    existing: outcome,
                });
            }
            Err(source) => return Err(GateError::Io { path, source }),
        };
        file.write_all(MARKER_CONTENT.as_bytes())
            .map_err(|source| GateError::Io {
                path: path.clone(),
                source,
            })?;

        info!(key = %key, %outcome, "Completion marker published");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Claim `key` and publish its terminal outcome. Exactly once per key.
    pub fn publish(&self, key: &MarkerKey, outcome: Outcome) -> Result<(), GateError> {
        if !self.claim(key)? {
            return Err(match self.peek(key)? {
                Some(existing) => GateError::AlreadyPublished {
                    key: key.clone(),
                    existing,
                },
                None => GateError::Claimed(key.clone()),
            });
        }
        if let Some(existing) = self.peek(key)? {
            return Err(GateError::AlreadyPublished {
                key: key.clone(),
                existing,
            });
        }
        self.commit(key, outcome)
    }

    /// Non-blocking check for an existing marker.
    pub fn peek(&self, key: &MarkerKey) -> Result<Option<Outcome>, GateError> {
        let done = key.path(&self.loops_root, Outcome::Success).exists();
        let failed = key.path(&self.loops_root, Outcome::Failure).exists();
        match (done, failed) {
            (true, true) => Err(GateError::ConflictingMarkers(key.clone())),
            (true, false) => Ok(Some(Outcome::Success)),
            (false, true) => Ok(Some(Outcome::Failure)),
            (false, false) => Ok(None),
        }
    }

    /// Wait until a marker for `key` exists, or `budget` elapses.
    ///
    /// Idempotent: once a marker exists every call returns the same outcome.
    pub async fn await_outcome(
        &self,
        key: &MarkerKey,
        budget: Duration,
    ) -> Result<GateOutcome, GateError> {
        let deadline = Instant::now() + budget;
        loop {
            // Register before checking so a publish between the check and
            // the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.peek(key)? {
                return Ok(outcome.into());
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, budget_ms = budget.as_millis() as u64, "Gate wait timed out");
                return Ok(GateOutcome::Timeout);
            }

            let wait = self.poll_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Every marker present for a loop, sorted by task then dispatch.
    pub fn published(&self, loop_number: u32) -> Result<Vec<(MarkerKey, Outcome)>, GateError> {
        let dir = complete_dir(&self.loops_root, loop_number);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| GateError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut markers: Vec<(MarkerKey, Outcome)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|name| MarkerKey::from_file_name(loop_number, name))
            })
            .collect();
        markers.sort_by(|a, b| {
            a.0.task_id
                .cmp(&b.0.task_id)
                .then(a.0.dispatch.cmp(&b.0.dispatch))
        });
        Ok(markers)
    }
}
