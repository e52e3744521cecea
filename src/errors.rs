//! Typed error hierarchy for the Foreman orchestration core.
//!
//! One enum per subsystem:
//! - `StoreError`: task/issue records, identifiers and graph validation
//! - `GateError`: completion marker publication and observation
//! - `DecompositionError`: batch construction and its invariants
//! - `DispatchError`: the scheduler loop

use std::path::PathBuf;

use thiserror::Error;

use crate::gate::{MarkerKey, Outcome};

/// Errors from the task and issue stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid task id '{0}': expected TASK-NNN, TASK-TNN or TASK-99999")]
    InvalidTaskId(String),

    #[error("Invalid issue id '{0}': expected ISSUE-NNN")]
    InvalidIssueId(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Unknown dependency '{dependency}' in task '{task}': no task with that id exists")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {0:?}")]
    Cycle(Vec<String>),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Issue {0} not found")]
    IssueNotFound(String),

    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Invalid {field} '{value}' for {id}")]
    InvalidField {
        id: String,
        field: &'static str,
        value: String,
    },

    #[error("Issue {0} is halted and requires manual intervention")]
    IssueHalted(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt store file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the completion gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Marker for {key} already published as {existing}")]
    AlreadyPublished { key: MarkerKey, existing: Outcome },

    #[error("Protocol violation: both success and failure markers exist for {0}")]
    ConflictingMarkers(MarkerKey),

    #[error("Marker I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Marker for {0} is claimed by another publisher")]
    Claimed(MarkerKey),

    #[error("Gate I/O task failed: {0}")]
    Blocking(String),

    #[error("Failed to write failure report: {0}")]
    Report(#[from] StoreError),
}

/// Errors from the decomposition engine.
#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("Build task {task} has no dependency on a root test task")]
    TddViolation { task: String },

    #[error(
        "Test coverage mismatch: {} missing, {} duplicated, {} unexpected",
        missing.len(),
        duplicated.len(),
        unexpected.len()
    )]
    CoverageMismatch {
        missing: Vec<String>,
        duplicated: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Feature '{0}' declares no test identifiers")]
    FeatureWithoutTests(String),

    #[error("Feature '{feature}' depends on unknown feature '{dependency}'")]
    UnknownFeature { feature: String, dependency: String },

    #[error("Batch exceeds the {kind} id space ({limit} tasks)")]
    IdSpaceExhausted { kind: &'static str, limit: u32 },

    #[error("Nothing to decompose: {0}")]
    EmptySource(String),

    #[error("Mode {mode} requires {what}")]
    MissingSource { mode: String, what: &'static str },

    #[error("Failed to parse source document {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the dispatcher loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("Loop {0} has no tasks")]
    EmptyLoop(u32),

    #[error("Dispatch slot closed unexpectedly: {0}")]
    SlotClosed(String),
}
