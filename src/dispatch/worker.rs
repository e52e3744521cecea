//! Worker-side harness: local retries, then exactly one terminal marker.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::dispatch::{AttemptContext, AttemptFailure, AttemptResult, TaskExecutor};
use crate::errors::GateError;
use crate::gate::{CompletionGate, MarkerKey, Outcome, Publication};
use crate::retry::{Attempt, FailureKind, FailureReport, RootCause, write_report};
use crate::store::Task;

/// Default worker-local attempt budget for test failures.
pub const DEFAULT_LOCAL_TEST_ATTEMPTS: u32 = 3;

/// Runs a task to a terminal outcome and publishes it.
pub struct WorkerHarness {
    executor: Arc<dyn TaskExecutor>,
    gate: Arc<CompletionGate>,
    local_test_attempts: u32,
}

impl WorkerHarness {
    pub fn new(executor: Arc<dyn TaskExecutor>, gate: Arc<CompletionGate>) -> Self {
        Self {
            executor,
            gate,
            local_test_attempts: DEFAULT_LOCAL_TEST_ATTEMPTS,
        }
    }

    pub fn with_local_test_attempts(mut self, attempts: u32) -> Self {
        self.local_test_attempts = attempts.max(1);
        self
    }

    /// Run `task` under `key` and publish its outcome.
    ///
    /// Test failures are retried locally; every other failure surfaces on
    /// the first attempt. Returns what the gate ended up holding for `key`.
    pub async fn run(&self, task: &Task, key: MarkerKey) -> Result<Publication, GateError> {
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut attempt = 1;

        let failure = loop {
            let ctx = AttemptContext::new(key.clone(), attempt, attempts.clone());
            let result = match self.executor.attempt(task, &ctx).await {
                Ok(result) => result,
                Err(e) => {
                    error!(task = %task.id, error = %e, "Executor error");
                    AttemptResult::Failed(AttemptFailure::new(
                        FailureKind::DependencyMissing,
                        RootCause::new("executor_error", &e.to_string(), task.id.as_str(), ""),
                    ))
                }
            };

            let failure = match result {
                AttemptResult::Passed => {
                    debug!(task = %task.id, attempt, "Attempt passed");
                    return self.publish(key, Outcome::Success, None).await;
                }
                AttemptResult::Failed(failure) => failure,
            };

            attempts.push(Attempt {
                number: attempt,
                approach: failure.approach.clone(),
                build_passed: failure.build_passed,
                output: failure.output.clone(),
                signature: failure.root_cause.signature(),
            });

            if failure.kind.retries_locally() && attempt < self.local_test_attempts {
                info!(
                    task = %task.id,
                    attempt,
                    max = self.local_test_attempts,
                    "Test failure, retrying locally"
                );
                attempt += 1;
                continue;
            }
            break failure;
        };

        let mut report = FailureReport::new(&key, failure.kind, failure.root_cause);
        for a in attempts {
            report = report.with_attempt(a);
        }
        self.publish(key, Outcome::Failure, Some(report.normalized()))
            .await
    }

    async fn publish(
        &self,
        key: MarkerKey,
        outcome: Outcome,
        report: Option<FailureReport>,
    ) -> Result<Publication, GateError> {
        publish_blocking(self.gate.clone(), key, outcome, report).await
    }
}

/// Claim `key`, write the optional report, then the marker.
///
/// Only the claim holder touches the report, so a losing publisher never
/// overwrites the evidence behind someone else's marker. Losing is not an
/// error: the marker already present comes back as `Resolved`, and a
/// claim with no marker yet comes back as `Claimed`.
pub fn publish_outcome(
    gate: &CompletionGate,
    key: &MarkerKey,
    outcome: Outcome,
    report: Option<&FailureReport>,
) -> Result<Publication, GateError> {
    if !gate.claim(key)? {
        return match gate.peek(key)? {
            Some(existing) => {
                warn!(key = %key, %existing, "Marker already present, not publishing");
                Ok(Publication::Resolved(existing))
            }
            None => {
                warn!(key = %key, "Marker claimed by another publisher");
                Ok(Publication::Claimed)
            }
        };
    }
    if let Some(existing) = gate.peek(key)? {
        warn!(key = %key, %existing, "Marker written without a claim, not publishing");
        return Ok(Publication::Resolved(existing));
    }
    if let Some(report) = report {
        write_report(gate.loops_root(), report)?;
    }
    match gate.commit(key, outcome) {
        Ok(()) => Ok(Publication::Published(outcome)),
        Err(GateError::AlreadyPublished { existing, .. }) => {
            warn!(key = %key, %existing, "Lost publish race");
            Ok(Publication::Resolved(existing))
        }
        Err(e) => Err(e),
    }
}

/// [`publish_outcome`] on the blocking pool, for async callers.
pub async fn publish_blocking(
    gate: Arc<CompletionGate>,
    key: MarkerKey,
    outcome: Outcome,
    report: Option<FailureReport>,
) -> Result<Publication, GateError> {
    tokio::task::spawn_blocking(move || publish_outcome(&gate, &key, outcome, report.as_ref()))
        .await
        .map_err(|e| GateError::Blocking(e.to_string()))?
}
