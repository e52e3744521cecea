//! Remediation issues raised by failure analysis.
//!
//! The issue store is global across loops. An issue is consumed by the
//! decomposition engine, completed when its remediation task succeeds, or
//! halted when repeated identical failures trip the loop-breaker. A
//! remediation task that fails terminally raises a successor issue and the
//! source issue is superseded by it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::store::{RetryLedger, TaskId};

static ISSUE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ISSUE-\d{3,}$").expect("valid issue id regex"));

/// A validated issue identifier (`ISSUE-NNN`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IssueId(String);

impl IssueId {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim();
        if ISSUE_ID_PATTERN.is_match(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(StoreError::InvalidIssueId(raw.to_string()))
        }
    }

    pub fn from_number(number: u32) -> Self {
        Self(format!("ISSUE-{:03}", number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IssueId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IssueId> for String {
    fn from(id: IssueId) -> Self {
        id.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Pending,
    InProgress,
    Accepted,
    Completed,
    Halted,
    /// Replaced by the issue raised when its remediation task failed.
    Superseded,
}

impl IssueStatus {
    /// Statuses the decomposition engine may pick up.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Accepted)
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Accepted => "accepted",
            Self::Completed => "completed",
            Self::Halted => "halted",
            Self::Superseded => "superseded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// A remediation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: IssueId,
    pub title: String,
    pub status: IssueStatus,
    pub priority: Priority,
    pub root_cause: String,
    #[serde(flatten)]
    pub ledger: RetryLedger,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub halted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task: Option<TaskId>,
    #[serde(default)]
    pub origin_loop: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<IssueId>,
}

impl Issue {
    /// The `critical_only` selection predicate.
    pub fn is_decomposable_critical(&self) -> bool {
        self.priority == Priority::Critical && self.status.is_open() && !self.halted
    }

    /// The `improvement_loop` selection predicate.
    pub fn is_decomposable(&self) -> bool {
        self.status.is_open() && !self.halted
    }
}

/// Everything needed to create an issue; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDraft {
    pub title: String,
    pub priority: Priority,
    pub root_cause: String,
    pub ledger: RetryLedger,
    pub blocking: bool,
    pub halted: bool,
    pub source_task: Option<TaskId>,
    pub origin_loop: u32,
}

impl IssueDraft {
    pub fn new(title: &str, priority: Priority, root_cause: &str) -> Self {
        Self {
            title: title.to_string(),
            priority,
            root_cause: root_cause.to_string(),
            ledger: RetryLedger::default(),
            blocking: false,
            halted: false,
            source_task: None,
            origin_loop: 0,
        }
    }

    pub fn with_ledger(mut self, ledger: RetryLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn from_task(mut self, task: &TaskId, loop_number: u32) -> Self {
        self.source_task = Some(task.clone());
        self.origin_loop = loop_number;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn halted(mut self) -> Self {
        self.halted = true;
        self
    }
}

/// All issues, keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueStore {
    #[serde(default)]
    next_number: u32,
    #[serde(default)]
    issues: BTreeMap<IssueId, Issue>,
}

impl IssueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn get(&self, id: &IssueId) -> Option<&Issue> {
        self.issues.get(id)
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.values()
    }

    /// Create an issue from a draft and return its id.
    pub fn create(&mut self, draft: IssueDraft) -> IssueId {
        let number = self
            .next_number
            .max(self.issues.len() as u32)
            .saturating_add(1);
        self.next_number = number;
        let id = IssueId::from_number(number);
        let status = if draft.halted {
            IssueStatus::Halted
        } else {
            IssueStatus::Pending
        };
        let issue = Issue {
            id: id.clone(),
            title: draft.title,
            status,
            priority: draft.priority,
            root_cause: draft.root_cause,
            ledger: draft.ledger,
            blocking: draft.blocking,
            halted: draft.halted,
            source_task: draft.source_task,
            origin_loop: draft.origin_loop,
            created_at: Utc::now(),
            halt_reason: None,
            superseded_by: None,
        };
        info!(issue = %id, priority = %issue.priority, halted = issue.halted, "Issue created");
        self.issues.insert(id.clone(), issue);
        id
    }

    /// Critical, open, non-halted issues in id order.
    pub fn critical_backlog(&self) -> Vec<&Issue> {
        self.issues
            .values()
            .filter(|i| i.is_decomposable_critical())
            .collect()
    }

    /// Every open, non-halted issue, highest priority first.
    pub fn open_backlog(&self) -> Vec<&Issue> {
        let mut open: Vec<&Issue> = self.issues.values().filter(|i| i.is_decomposable()).collect();
        open.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        open
    }

    /// Consumed by decomposition. Refuses halted issues.
    pub fn mark_in_progress(&mut self, id: &IssueId) -> Result<(), StoreError> {
        let issue = self.require_mut(id)?;
        if issue.halted {
            return Err(StoreError::IssueHalted(id.to_string()));
        }
        if !issue.status.is_open() {
            return Err(illegal(id, issue.status, IssueStatus::InProgress));
        }
        issue.status = IssueStatus::InProgress;
        Ok(())
    }

    /// Manual triage: accept a pending issue for the next cycle.
    pub fn accept(&mut self, id: &IssueId) -> Result<(), StoreError> {
        let issue = self.require_mut(id)?;
        if issue.status != IssueStatus::Pending {
            return Err(illegal(id, issue.status, IssueStatus::Accepted));
        }
        issue.status = IssueStatus::Accepted;
        Ok(())
    }

    /// The derived remediation task succeeded.
    pub fn mark_completed(&mut self, id: &IssueId) -> Result<(), StoreError> {
        let issue = self.require_mut(id)?;
        if issue.halted {
            return Err(StoreError::IssueHalted(id.to_string()));
        }
        issue.status = IssueStatus::Completed;
        Ok(())
    }

    /// Close an issue whose remediation failed in favour of `successor`.
    pub fn supersede(&mut self, id: &IssueId, successor: &IssueId) -> Result<(), StoreError> {
        let issue = self.require_mut(id)?;
        if issue.halted {
            return Err(StoreError::IssueHalted(id.to_string()));
        }
        if issue.status == IssueStatus::Completed {
            return Err(illegal(id, issue.status, IssueStatus::Superseded));
        }
        issue.status = IssueStatus::Superseded;
        issue.superseded_by = Some(successor.clone());
        info!(issue = %id, successor = %successor, "Issue superseded");
        Ok(())
    }

    /// Loop-breaker. Once halted, no automated task creation happens again.
    pub fn halt(&mut self, id: &IssueId, reason: &str) -> Result<(), StoreError> {
        let issue = self.require_mut(id)?;
        if !issue.halted {
            warn!(issue = %id, reason, "Issue halted; manual intervention required");
        }
        issue.halted = true;
        issue.status = IssueStatus::Halted;
        issue.halt_reason = Some(reason.to_string());
        Ok(())
    }

    /// Update the carried ledger of an issue (used when halting after a
    /// failure so the final signature history is recorded).
    pub fn update_ledger(&mut self, id: &IssueId, ledger: RetryLedger) -> Result<(), StoreError> {
        self.require_mut(id)?.ledger = ledger;
        Ok(())
    }

    /// Manual intervention: clear a halt so the issue can be decomposed again.
    ///
    /// Signature history is kept; the repeat counter and retry count start over.
    pub fn reopen(&mut self, id: &IssueId) -> Result<(), StoreError> {
        let issue = self.require_mut(id)?;
        if !issue.halted {
            return Err(illegal(id, issue.status, IssueStatus::Pending));
        }
        issue.halted = false;
        issue.status = IssueStatus::Pending;
        issue.halt_reason = None;
        issue.ledger.signature_repeat_count = 0;
        issue.ledger.retry_count = 0;
        info!(issue = %id, "Issue reopened");
        Ok(())
    }

    fn require_mut(&mut self, id: &IssueId) -> Result<&mut Issue, StoreError> {
        self.issues
            .get_mut(id)
            .ok_or_else(|| StoreError::IssueNotFound(id.to_string()))
    }
}

fn illegal(id: &IssueId, from: IssueStatus, to: IssueStatus) -> StoreError {
    StoreError::IllegalTransition {
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
