//! The retry and failure-dedup state machine.
//!
//! Decision order for one failure event:
//! 1. Timeout: consume budget, leave signatures alone.
//! 2. Record the signature; a run of identical signatures at the threshold halts.
//! 3. Immediate-fail categories escalate.
//! 4. Otherwise consume budget and re-dispatch, or report exhaustion.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::retry::{DefaultAnalyst, Disposition, FailureAnalyst, FailureKind, FailureReport};
use crate::store::{IssueId, IssueStore, RetryLedger, Task};

/// Default run length of identical signatures that halts a task.
pub const DEFAULT_REPEAT_THRESHOLD: u32 = 3;

/// Tunables for the engine. The retry budget itself lives on each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub signature_repeat_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            signature_repeat_threshold: DEFAULT_REPEAT_THRESHOLD,
        }
    }
}

/// Per-task retry state after a failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "attempt")]
pub enum RetryState {
    /// Re-dispatch; the payload is the retry number about to run.
    Attempting(u32),
    Exhausted,
    Escalated,
    Halted,
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Attempting(_))
    }
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempting(n) => write!(f, "attempting({})", n),
            Self::Exhausted => f.write_str("exhausted"),
            Self::Escalated => f.write_str("escalated"),
            Self::Halted => f.write_str("halted"),
        }
    }
}

/// Outcome of one `on_failure` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub state: RetryState,
    /// Issue raised or halted by this decision.
    pub issue: Option<IssueId>,
}

impl Verdict {
    pub fn should_redispatch(&self) -> bool {
        !self.state.is_terminal()
    }

    fn retry(n: u32) -> Self {
        Self {
            state: RetryState::Attempting(n),
            issue: None,
        }
    }
}

pub struct RetryEngine {
    policy: RetryPolicy,
    analyst: Arc<dyn FailureAnalyst>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            analyst: Arc::new(DefaultAnalyst),
        }
    }

    pub fn with_analyst(mut self, analyst: Arc<dyn FailureAnalyst>) -> Self {
        self.analyst = analyst;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Apply one failure event to `task`'s ledger and decide what happens next.
    ///
    /// Issues raised here carry the task's ledger so loop detection and the
    /// retry bound survive into the next decomposition cycle.
    pub fn on_failure(
        &self,
        task: &mut Task,
        report: &FailureReport,
        issues: &mut IssueStore,
        loop_number: u32,
    ) -> Result<Verdict, StoreError> {
        if report.kind == FailureKind::Timeout {
            return Ok(self.consume_budget(task, report, issues, loop_number));
        }

        let repeats = record_signature(&mut task.ledger, report);
        if repeats >= self.policy.signature_repeat_threshold {
            let issue = self.halt(task, report, issues, loop_number)?;
            return Ok(Verdict {
                state: RetryState::Halted,
                issue: Some(issue),
            });
        }

        if report.kind.is_immediate() {
            let issue = self.raise(task, report, issues, loop_number, Disposition::Escalated);
            warn!(task = %task.id, kind = %report.kind, issue = %issue, "Escalated without retry");
            return Ok(Verdict {
                state: RetryState::Escalated,
                issue: Some(issue),
            });
        }

        Ok(self.consume_budget(task, report, issues, loop_number))
    }

    fn consume_budget(
        &self,
        task: &mut Task,
        report: &FailureReport,
        issues: &mut IssueStore,
        loop_number: u32,
    ) -> Verdict {
        task.ledger.retry_count += 1;
        if task.ledger.has_budget() {
            info!(
                task = %task.id,
                kind = %report.kind,
                retry = task.ledger.retry_count,
                max = task.ledger.max_retries,
                "Scheduling retry"
            );
            return Verdict::retry(task.ledger.retry_count);
        }

        let issue = self.raise(task, report, issues, loop_number, Disposition::Exhausted);
        warn!(
            task = %task.id,
            retries = task.ledger.retry_count,
            issue = %issue,
            "Retry budget exhausted"
        );
        Verdict {
            state: RetryState::Exhausted,
            issue: Some(issue),
        }
    }

    /// Halt the linked issue, or raise a halted one if the task has none.
    fn halt(
        &self,
        task: &Task,
        report: &FailureReport,
        issues: &mut IssueStore,
        loop_number: u32,
    ) -> Result<IssueId, StoreError> {
        let reason = format!(
            "signature {} repeated {} times in a row",
            task.ledger
                .failure_signature
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("-"),
            task.ledger.signature_repeat_count
        );

        match task.source_issue.as_ref().filter(|id| issues.get(id).is_some()) {
            Some(id) => {
                issues.update_ledger(id, task.ledger.clone())?;
                issues.halt(id, &reason)?;
                Ok(id.clone())
            }
            None => {
                let id = self.raise(task, report, issues, loop_number, Disposition::Halted);
                issues.halt(&id, &reason)?;
                Ok(id)
            }
        }
    }

    fn raise(
        &self,
        task: &Task,
        report: &FailureReport,
        issues: &mut IssueStore,
        loop_number: u32,
        disposition: Disposition,
    ) -> IssueId {
        let mut draft = self
            .analyst
            .analyze(task, report, disposition)
            .with_ledger(task.ledger.clone())
            .from_task(&task.id, loop_number);
        if disposition == Disposition::Halted {
            draft = draft.halted();
        }
        let id = issues.create(draft);

        if let Some(source) = task.source_issue.as_ref().filter(|s| issues.get(s).is_some()) {
            if let Err(e) = issues.supersede(source, &id) {
                warn!(issue = %source, successor = %id, error = %e, "Source issue not superseded");
            }
        }
        id
    }
}

/// Push the report's signature into the ledger; returns the current run length.
fn record_signature(ledger: &mut RetryLedger, report: &FailureReport) -> u32 {
    let signature = report.signature();
    if ledger.failure_signature.as_ref() == Some(&signature) {
        ledger.signature_repeat_count += 1;
    } else {
        if let Some(previous) = ledger.failure_signature.take() {
            ledger.previous_signatures.push(previous);
        }
        ledger.failure_signature = Some(signature);
        ledger.signature_repeat_count = 1;
    }
    ledger.signature_repeat_count
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gate::MarkerKey;
    use crate::retry::RootCause;
    use crate::store::{IssueDraft, IssueStatus, Priority, TaskId, TaskKind};

    fn task(max_retries: u32) -> Task {
        Task::new(TaskId::build(1), TaskKind::Build, "Login", "auth")
            .with_ledger(RetryLedger::with_max_retries(max_retries))
    }

    fn report(task: &Task, kind: FailureKind, error: &str) -> FailureReport {
        FailureReport::new(
            &MarkerKey::new(task.id.clone(), 1, task.dispatch_count.max(1)),
            kind,
            RootCause::new("assertion", error, "AUTH-001", "src/login.rs"),
        )
    }

    fn engine(threshold: u32) -> RetryEngine {
        RetryEngine::new(RetryPolicy {
            signature_repeat_threshold: threshold,
        })
    }

    #[test]
    fn test_non_consecutive_repeat_does_not_halt() {
        let engine = engine(2);
        let mut issues = IssueStore::new();
        let mut t = task(10);

        for error in ["S1", "S2", "S1"] {
            let r = report(&t, FailureKind::TestFailure, error);
            let verdict = engine.on_failure(&mut t, &r, &mut issues, 1).unwrap();
            assert!(verdict.should_redispatch());
        }

        assert_eq!(t.ledger.retry_count, 3);
        assert_eq!(t.ledger.previous_signatures.len(), 2);
        assert_eq!(t.ledger.signature_repeat_count, 1);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_consecutive_repeat_halts_before_budget() {
        let engine = engine(2);
        let mut issues = IssueStore::new();
        let mut t = task(10);

        let r = report(&t, FailureKind::TestFailure, "S1");
        assert!(engine.on_failure(&mut t, &r, &mut issues, 1).unwrap().should_redispatch());
        let verdict = engine.on_failure(&mut t, &r, &mut issues, 1).unwrap();

        assert_eq!(verdict.state, RetryState::Halted);
        assert!(t.ledger.retry_count < t.ledger.max_retries);
        let issue = issues.get(verdict.issue.as_ref().unwrap()).unwrap();
        assert!(issue.halted);
        assert_eq!(issue.status, IssueStatus::Halted);
        assert_eq!(issue.ledger.signature_repeat_count, 2);
    }

    #[test]
    fn test_halt_marks_linked_issue() {
        let engine = engine(2);
        let mut issues = IssueStore::new();
        let source = issues.create(IssueDraft::new("Fix login", Priority::High, "flaky"));
        issues.mark_in_progress(&source).unwrap();

        let mut t = task(10).with_source_issue(source.clone());
        let r = report(&t, FailureKind::TestFailure, "S1");
        engine.on_failure(&mut t, &r, &mut issues, 2).unwrap();
        let verdict = engine.on_failure(&mut t, &r, &mut issues, 2).unwrap();

        assert_eq!(verdict.issue, Some(source.clone()));
        assert_eq!(issues.len(), 1);
        let halted = issues.get(&source).unwrap();
        assert!(halted.halted);
        assert_eq!(halted.ledger.failure_signature, t.ledger.failure_signature);
    }

    #[test]
    fn test_escalated_remediation_supersedes_source_issue() {
        let engine = engine(3);
        let mut issues = IssueStore::new();
        let source = issues.create(IssueDraft::new("Fix login", Priority::High, "flaky"));
        issues.mark_in_progress(&source).unwrap();

        let mut t = Task::new(TaskId::build(2), TaskKind::Remediation, "Fix", "auth")
            .with_source_issue(source.clone());
        let r = report(&t, FailureKind::BuildFailure, "E0308");
        let verdict = engine.on_failure(&mut t, &r, &mut issues, 2).unwrap();

        assert_eq!(verdict.state, RetryState::Escalated);
        let successor = verdict.issue.unwrap();
        assert_ne!(successor, source);
        let closed = issues.get(&source).unwrap();
        assert_eq!(closed.status, IssueStatus::Superseded);
        assert_eq!(closed.superseded_by.as_ref(), Some(&successor));
        assert_eq!(issues.get(&successor).unwrap().status, IssueStatus::Pending);
    }

    #[test]
    fn test_exhausted_remediation_supersedes_source_issue() {
        let engine = engine(10);
        let mut issues = IssueStore::new();
        let source = issues.create(IssueDraft::new("Fix login", Priority::High, "flaky"));
        issues.mark_in_progress(&source).unwrap();

        let mut t = Task::new(TaskId::build(2), TaskKind::Remediation, "Fix", "auth")
            .with_ledger(RetryLedger::with_max_retries(1))
            .with_source_issue(source.clone());
        let r = report(&t, FailureKind::TestFailure, "S1");
        let verdict = engine.on_failure(&mut t, &r, &mut issues, 2).unwrap();

        assert_eq!(verdict.state, RetryState::Exhausted);
        assert_eq!(issues.get(&source).unwrap().status, IssueStatus::Superseded);
        assert!(issues.open_backlog().iter().all(|i| i.id != source));
    }

    #[test]
    fn test_bounded_redispatch_then_exhausted() {
        let engine = engine(3);
        let mut issues = IssueStore::new();
        let mut t = task(4);

        let mut redispatches = 0;
        let mut n = 0;
        loop {
            n += 1;
            let r = report(&t, FailureKind::TestFailure, &format!("distinct {}", n));
            let verdict = engine.on_failure(&mut t, &r, &mut issues, 1).unwrap();
            if !verdict.should_redispatch() {
                assert_eq!(verdict.state, RetryState::Exhausted);
                break;
            }
            redispatches += 1;
        }

        assert_eq!(redispatches, 3);
        assert_eq!(t.ledger.retry_count, 4);
        let issue = issues.issues().next().unwrap();
        assert_eq!(issue.ledger.retry_count, 4);
        assert_eq!(issue.ledger.max_retries, 4);
        assert_eq!(issue.ledger.signature_history().len(), 4);
        assert_eq!(issue.source_task, Some(TaskId::build(1)));
    }

    #[test]
    fn test_immediate_kind_escalates_on_first_occurrence() {
        let engine = engine(3);
        let mut issues = IssueStore::new();
        let mut t = task(10);

        let r = report(&t, FailureKind::BuildFailure, "linker error");
        let verdict = engine.on_failure(&mut t, &r, &mut issues, 1).unwrap();

        assert_eq!(verdict.state, RetryState::Escalated);
        assert_eq!(t.ledger.retry_count, 0);
        let issue = issues.get(verdict.issue.as_ref().unwrap()).unwrap();
        assert_eq!(issue.priority, Priority::Critical);
        assert!(issue.blocking);
        assert!(issue.is_decomposable_critical());
    }

    #[test]
    fn test_timeout_consumes_budget_but_not_signatures() {
        let engine = engine(2);
        let mut issues = IssueStore::new();
        let mut t = task(10);

        let r = report(&t, FailureKind::TestFailure, "S1");
        engine.on_failure(&mut t, &r, &mut issues, 1).unwrap();

        let timeout = FailureReport::timeout(
            &MarkerKey::new(t.id.clone(), 1, 2),
            Duration::from_secs(30),
        );
        let verdict = engine.on_failure(&mut t, &timeout, &mut issues, 1).unwrap();
        assert_eq!(verdict.state, RetryState::Attempting(2));
        assert_eq!(t.ledger.signature_repeat_count, 1);
        assert!(t.ledger.previous_signatures.is_empty());

        // Still consecutive with the earlier S1 once the timeout is skipped
        let verdict = engine.on_failure(&mut t, &r, &mut issues, 1).unwrap();
        assert_eq!(verdict.state, RetryState::Halted);
    }

    #[test]
    fn test_repeat_of_inherited_signature_halts_remediation() {
        let engine = engine(2);
        let mut issues = IssueStore::new();

        let mut original = task(10);
        let r = report(&original, FailureKind::BuildFailure, "S1");
        let escalated = engine.on_failure(&mut original, &r, &mut issues, 1).unwrap();
        let issue_id = escalated.issue.unwrap();
        issues.mark_in_progress(&issue_id).unwrap();

        let inherited = issues.get(&issue_id).unwrap().ledger.clone();
        let mut remediation = Task::new(TaskId::build(2), TaskKind::Remediation, "Fix", "auth")
            .with_ledger(inherited)
            .with_source_issue(issue_id.clone());

        let verdict = engine.on_failure(&mut remediation, &r, &mut issues, 2).unwrap();
        assert_eq!(verdict.state, RetryState::Halted);
        assert!(issues.get(&issue_id).unwrap().halted);
    }
}
