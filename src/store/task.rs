//! Task records and the per-loop task store.
//!
//! Field ownership is partitioned by writer:
//! - the decomposition engine creates tasks (`insert_batch`)
//! - the dispatcher moves `pending -> in_progress` (`mark_dispatched`)
//! - gate outcomes move tasks to `done`/`failed` (`record_outcome`)
//! - the retry engine owns the `RetryLedger`

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dag::TaskGraph;
use crate::errors::StoreError;
use crate::gate::Outcome;
use crate::retry::FailureSignature;
use crate::store::IssueId;

static TASK_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^TASK-(\d{3}|T\d{2}|99999)$").expect("valid task id regex"));

/// Sentinel id reserved for the terminal verification task of every batch.
pub const VERIFICATION_TASK_ID: &str = "TASK-99999";

/// Default orchestrator-level retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Which of the three id spaces a task id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIdKind {
    /// `TASK-NNN`
    Build,
    /// `TASK-TNN`
    TestBatch,
    /// `TASK-99999`
    Verification,
}

/// A validated task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Parse and validate a task id.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim();
        if TASK_ID_PATTERN.is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(StoreError::InvalidTaskId(raw.to_string()))
        }
    }

    /// `TASK-NNN` for a build or remediation task.
    pub fn build(number: u32) -> Self {
        Self(format!("TASK-{:03}", number))
    }

    /// `TASK-TNN` for a test-batch task.
    pub fn test_batch(number: u32) -> Self {
        Self(format!("TASK-T{:02}", number))
    }

    /// The terminal verification sentinel.
    pub fn verification() -> Self {
        Self(VERIFICATION_TASK_ID.to_string())
    }

    pub fn kind(&self) -> TaskIdKind {
        if self.0 == VERIFICATION_TASK_ID {
            TaskIdKind::Verification
        } else if self.0.starts_with("TASK-T") {
            TaskIdKind::TestBatch
        } else {
            TaskIdKind::Build
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "done" | "completed" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// What role a task plays in its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Defines tests ahead of the build tasks they verify.
    Test,
    /// Implements a feature.
    Build,
    /// Fixes an issue raised by failure analysis.
    Remediation,
    /// Terminal verification sink.
    Verification,
}

impl TaskKind {
    /// Build-like tasks are subject to TDD ordering.
    pub fn requires_tests(&self) -> bool {
        matches!(self, Self::Build | Self::Remediation)
    }
}

/// Rough sizing hint passed through to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown complexity '{}'", other)),
        }
    }
}

/// Scope a test task exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationLevel {
    #[default]
    Unit,
    Integration,
    EndToEnd,
}

/// What a test task may mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockPolicy {
    /// Real collaborators only.
    Forbidden,
    /// Mock external services, never the unit under test.
    #[default]
    ExternalOnly,
    Allowed,
}

/// Retry and signature bookkeeping shared by tasks and issues.
///
/// Carried from a failed task into the issue it raises, and from that issue
/// into the remediation task, so loop detection survives across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLedger {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_signature: Option<FailureSignature>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_signatures: Vec<FailureSignature>,
    /// Consecutive occurrences of `failure_signature`.
    #[serde(default)]
    pub signature_repeat_count: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for RetryLedger {
    fn default() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }
}

impl RetryLedger {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            failure_signature: None,
            previous_signatures: Vec::new(),
            signature_repeat_count: 0,
        }
    }

    /// Whether another orchestrator-level dispatch is allowed.
    pub fn has_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Full signature history, oldest first, including the current one.
    pub fn signature_history(&self) -> Vec<FailureSignature> {
        let mut all = self.previous_signatures.clone();
        if let Some(current) = &self.failure_signature {
            all.push(current.clone());
        }
        all
    }
}

/// A unit of work with status and dependency set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub kind: TaskKind,
    pub category: String,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(flatten)]
    pub ledger: RetryLedger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_issue: Option<IssueId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub test_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_level: Option<IntegrationLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_policy: Option<MockPolicy>,
    /// Number of times the dispatcher has handed this task to a worker.
    #[serde(default)]
    pub dispatch_count: u32,
    /// Highest dispatch ordinal whose outcome has been applied.
    #[serde(default)]
    pub resolved_dispatch: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: TaskId, kind: TaskKind, title: &str, category: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            description: String::new(),
            kind,
            category: category.to_string(),
            complexity: Complexity::default(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            ledger: RetryLedger::default(),
            source_issue: None,
            test_ids: BTreeSet::new(),
            integration_level: None,
            mock_policy: None,
            dispatch_count: 0,
            resolved_dispatch: 0,
            created_at: Utc::now(),
        }
    }

    /// A test task covering the given test identifiers.
    pub fn test(id: TaskId, title: &str, category: &str, test_ids: BTreeSet<String>) -> Self {
        let mut task = Self::new(id, TaskKind::Test, title, category);
        task.test_ids = test_ids;
        task.integration_level = Some(IntegrationLevel::default());
        task.mock_policy = Some(MockPolicy::default());
        task
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_ledger(mut self, ledger: RetryLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_source_issue(mut self, issue: IssueId) -> Self {
        self.source_issue = Some(issue);
        self
    }

    pub fn with_test_profile(mut self, level: IntegrationLevel, mocks: MockPolicy) -> Self {
        self.integration_level = Some(level);
        self.mock_policy = Some(mocks);
        self
    }

    /// In progress, but the current dispatch already failed and was
    /// applied: only a re-dispatch is owed.
    pub fn awaiting_redispatch(&self) -> bool {
        self.status == TaskStatus::InProgress
            && self.dispatch_count > 0
            && self.resolved_dispatch >= self.dispatch_count
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// A test task nothing else must precede.
    pub fn is_root_test(&self) -> bool {
        self.kind == TaskKind::Test && self.dependencies.is_empty()
    }
}

/// All tasks of one loop, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStore {
    pub loop_number: u32,
    #[serde(default)]
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskStore {
    pub fn new(loop_number: u32) -> Self {
        Self {
            loop_number,
            tasks: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Insert a batch of new tasks.
    ///
    /// The combined task set must stay a DAG with no dangling references;
    /// the whole batch is rejected otherwise.
    pub fn insert_batch(&mut self, batch: Vec<Task>) -> Result<(), StoreError> {
        let mut combined: Vec<&Task> = self.tasks.values().collect();
        let mut seen: BTreeSet<&TaskId> = self.tasks.keys().collect();
        for task in &batch {
            if !seen.insert(&task.id) {
                return Err(StoreError::DuplicateTask(task.id.to_string()));
            }
            combined.push(task);
        }
        TaskGraph::build(combined)?;

        for task in batch {
            self.tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    /// Dispatcher-owned transition. Returns the new dispatch ordinal.
    ///
    /// A pending task moves to `in_progress`; an `in_progress` task is
    /// re-dispatched under a fresh ordinal.
    pub fn mark_dispatched(&mut self, id: &TaskId) -> Result<u32, StoreError> {
        let deps_done = {
            let task = self.require(id)?;
            task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|t| t.status.is_success())
            })
        };
        let task = self.require_mut(id)?;
        if task.status.is_terminal() || !deps_done {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            });
        }
        task.status = TaskStatus::InProgress;
        task.dispatch_count += 1;
        Ok(task.dispatch_count)
    }

    /// Apply an observed gate outcome. Terminal states are never reopened.
    pub fn record_outcome(&mut self, id: &TaskId, outcome: Outcome) -> Result<(), StoreError> {
        let task = self.require_mut(id)?;
        let to = match outcome {
            Outcome::Success => TaskStatus::Done,
            Outcome::Failure => TaskStatus::Failed,
        };
        if task.status != TaskStatus::InProgress {
            return Err(StoreError::IllegalTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }
        task.status = to;
        Ok(())
    }

    /// The outcome of `dispatch` has been applied to the task's ledger.
    pub fn mark_resolved(&mut self, id: &TaskId, dispatch: u32) -> Result<(), StoreError> {
        let task = self.require_mut(id)?;
        task.resolved_dispatch = task.resolved_dispatch.max(dispatch);
        Ok(())
    }

    /// Mutable access for the retry engine's ledger updates.
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task, StoreError> {
        self.require_mut(id)
    }

    /// Tasks currently held by a worker.
    pub fn in_progress(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Highest `TASK-NNN` number in use, for continuing numbering.
    pub fn max_build_number(&self) -> u32 {
        self.tasks
            .keys()
            .filter(|id| id.kind() == TaskIdKind::Build)
            .filter_map(|id| id.as_str().trim_start_matches("TASK-").parse::<u32>().ok())
            .max()
            .unwrap_or(0)
    }

    fn require(&self, id: &TaskId) -> Result<&Task, StoreError> {
        self.tasks
            .get(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    fn require_mut(&mut self, id: &TaskId) -> Result<&mut Task, StoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }
}
