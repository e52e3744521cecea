//! Failure reports written beside completion markers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::gate::MarkerKey;
use crate::retry::{FailureKind, FailureSignature, RootCause};
use crate::store::{TaskId, loop_dir_name, read_json, write_json};

/// Worker-local attempts recorded per report.
pub const MAX_LOCAL_ATTEMPTS: usize = 3;

const REPORTS_DIR: &str = "reports";

/// One worker-local attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub approach: String,
    pub build_passed: bool,
    #[serde(default)]
    pub output: String,
    pub signature: FailureSignature,
}

/// Why a dispatch failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub loop_number: u32,
    pub dispatch: u32,
    pub kind: FailureKind,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    /// Suspected root cause across all attempts.
    pub root_cause: RootCause,
    pub created_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(key: &MarkerKey, kind: FailureKind, root_cause: RootCause) -> Self {
        Self {
            task_id: key.task_id.clone(),
            loop_number: key.loop_number,
            dispatch: key.dispatch,
            kind,
            attempts: Vec::new(),
            root_cause,
            created_at: Utc::now(),
        }
    }

    /// Synthetic report for a worker that never published.
    pub fn timeout(key: &MarkerKey, budget: Duration) -> Self {
        Self::new(
            key,
            FailureKind::Timeout,
            RootCause::new(
                "timeout",
                &format!("no completion marker within {}s", budget.as_secs()),
                key.task_id.as_str(),
                "",
            ),
        )
    }

    /// Record a local attempt. Ignored past the attempt cap.
    pub fn with_attempt(mut self, attempt: Attempt) -> Self {
        if self.attempts.len() < MAX_LOCAL_ATTEMPTS {
            self.attempts.push(attempt);
        }
        self
    }

    /// Enforce the attempt rules: none for immediate kinds, at most three otherwise.
    pub fn normalized(mut self) -> Self {
        if self.kind.is_immediate() {
            self.attempts.clear();
        } else {
            self.attempts.truncate(MAX_LOCAL_ATTEMPTS);
        }
        self
    }

    pub fn signature(&self) -> FailureSignature {
        self.root_cause.signature()
    }

    pub fn marker_key(&self) -> MarkerKey {
        MarkerKey::new(self.task_id.clone(), self.loop_number, self.dispatch)
    }
}

/// `loops/loop-NNN/reports/TASK-001.2.json`
pub fn report_path(loops_root: &Path, key: &MarkerKey) -> PathBuf {
    loops_root
        .join(loop_dir_name(key.loop_number))
        .join(REPORTS_DIR)
        .join(format!("{}.json", key.file_stem()))
}

pub fn write_report(loops_root: &Path, report: &FailureReport) -> Result<PathBuf, StoreError> {
    let path = report_path(loops_root, &report.marker_key());
    write_json(&path, report)?;
    Ok(path)
}

pub fn read_report(loops_root: &Path, key: &MarkerKey) -> Result<Option<FailureReport>, StoreError> {
    read_json(&report_path(loops_root, key))
}
