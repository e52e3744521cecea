//! Turning a failure into an issue.

use std::fmt;

use crate::retry::{FailureKind, FailureReport};
use crate::store::{IssueDraft, Priority, Task};

/// Why the retry engine is raising an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Immediate-fail category on first occurrence.
    Escalated,
    /// Retry budget spent.
    Exhausted,
    /// Identical signature repeated past the threshold.
    Halted,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Escalated => f.write_str("escalated"),
            Self::Exhausted => f.write_str("exhausted"),
            Self::Halted => f.write_str("halted"),
        }
    }
}

/// Failure analysis collaborator.
///
/// The retry engine fills in the ledger, origin and halt flag on the
/// returned draft; implementations only describe the problem.
pub trait FailureAnalyst: Send + Sync {
    fn analyze(&self, task: &Task, report: &FailureReport, disposition: Disposition) -> IssueDraft;
}

/// Derives the issue straight from the report's root cause.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAnalyst;

impl FailureAnalyst for DefaultAnalyst {
    fn analyze(&self, task: &Task, report: &FailureReport, disposition: Disposition) -> IssueDraft {
        let priority = match (disposition, report.kind) {
            (Disposition::Escalated, _) | (Disposition::Halted, _) => Priority::Critical,
            (Disposition::Exhausted, FailureKind::Timeout) => Priority::Medium,
            (Disposition::Exhausted, _) => Priority::High,
        };
        let title = format!("Fix {} in {}: {}", report.kind, task.id, task.title);
        let draft = IssueDraft::new(&title, priority, &report.root_cause.summary());
        if disposition == Disposition::Escalated {
            draft.blocking()
        } else {
            draft
        }
    }
}
