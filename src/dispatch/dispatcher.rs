//! The scheduler loop.
//!
//! A single logical scheduler owns the task and issue stores for the
//! duration of a loop. Workers never touch the stores: they publish a
//! marker through the gate, and the scheduler applies the outcome.
//!
//! Each dispatch spawns two tasks:
//! - the worker harness, detached; a hung worker is abandoned, not aborted
//! - a waiter holding the slot permit until the gate resolves or times out

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::dag::DependencyResolver;
use crate::dispatch::state::{DispatchEvent, RunSummary};
use crate::dispatch::worker::{DEFAULT_LOCAL_TEST_ATTEMPTS, WorkerHarness, publish_blocking};
use crate::dispatch::TaskExecutor;
use crate::errors::{DispatchError, GateError, StoreError};
use crate::gate::{CompletionGate, GateOutcome, MarkerKey, Outcome, Publication};
use crate::retry::{
    FailureAnalyst, FailureKind, FailureReport, RetryEngine, RetryPolicy, RetryState, RootCause,
    read_report,
};
use crate::store::{IssueStore, Store, TaskId, TaskKind, TaskStore};

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent worker slots.
    pub max_parallel: usize,
    /// How long to wait for a marker before declaring a timeout.
    pub gate_timeout: Duration,
    /// Fallback poll interval for out-of-process markers.
    pub poll_interval: Duration,
    pub local_test_attempts: u32,
}

/// Extra wait for a marker whose key another publisher has claimed.
const CLAIM_GRACE: Duration = Duration::from_secs(30);

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            gate_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_millis(500),
            local_test_attempts: DEFAULT_LOCAL_TEST_ATTEMPTS,
        }
    }
}

/// What a waiter reports back to the scheduler.
struct Resolution {
    key: MarkerKey,
    outcome: Result<Outcome, GateError>,
}

/// Mutable state of one `run_loop` call.
struct LoopState {
    tasks: TaskStore,
    issues: IssueStore,
    summary: RunSummary,
    retry_queue: VecDeque<TaskId>,
}

pub struct Dispatcher {
    store: Store,
    config: DispatchConfig,
    gate: Arc<CompletionGate>,
    executor: Arc<dyn TaskExecutor>,
    engine: RetryEngine,
    event_tx: Option<mpsc::Sender<DispatchEvent>>,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        executor: Arc<dyn TaskExecutor>,
        config: DispatchConfig,
        policy: RetryPolicy,
    ) -> Self {
        let gate = Arc::new(CompletionGate::new(
            store.loops_root(),
            config.poll_interval,
        ));
        Self {
            store,
            config,
            gate,
            executor,
            engine: RetryEngine::new(policy),
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<DispatchEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_analyst(mut self, analyst: Arc<dyn FailureAnalyst>) -> Self {
        self.engine = RetryEngine::new(self.engine.policy()).with_analyst(analyst);
        self
    }

    pub fn gate(&self) -> Arc<CompletionGate> {
        Arc::clone(&self.gate)
    }

    /// Run a loop until it settles: nothing ready and nothing in flight.
    ///
    /// In-progress tasks left by a previous controller are recovered first:
    /// an unapplied marker is applied, otherwise the task is re-dispatched
    /// under a fresh ordinal. A gate error for one key fails that task
    /// only.
    pub async fn run_loop(&self, loop_number: u32) -> Result<RunSummary, DispatchError> {
        let started = Instant::now();
        let tasks = self.store.load_tasks(loop_number)?;
        if tasks.is_empty() {
            return Err(DispatchError::EmptyLoop(loop_number));
        }

        let mut state = LoopState {
            issues: self.store.load_issues()?,
            summary: RunSummary::new(loop_number),
            retry_queue: VecDeque::new(),
            tasks,
        };
        info!(loop_number, tasks = state.tasks.len(), "Loop started");
        self.emit(DispatchEvent::LoopStarted {
            loop_number,
            tasks: state.tasks.len(),
        })
        .await;

        self.recover(&mut state, loop_number).await?;

        let slots = self.config.max_parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(slots));
        let (result_tx, mut result_rx) = mpsc::channel::<Resolution>(slots * 2);
        let mut in_flight = 0usize;

        loop {
            let mut ready: VecDeque<TaskId> = DependencyResolver::new(&state.tasks)
                .ready()
                .into_iter()
                .map(|t| t.id.clone())
                .collect();

            // Re-dispatches first, then newly ready tasks
            while !(state.retry_queue.is_empty() && ready.is_empty()) {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(id) = state.retry_queue.pop_front().or_else(|| ready.pop_front()) else {
                    break;
                };
                self.dispatch(&mut state, &id, loop_number, permit, &result_tx)
                    .await?;
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let resolution = result_rx
                .recv()
                .await
                .ok_or_else(|| DispatchError::SlotClosed("result channel".to_string()))?;
            in_flight -= 1;

            match resolution.outcome {
                Ok(outcome) => self.resolve(&mut state, resolution.key, outcome).await?,
                Err(e) => self.resolve_gate_error(&mut state, resolution.key, e).await?,
            }
        }

        state.summary.finalize(&state.tasks, started.elapsed());
        info!(
            loop_number,
            done = state.summary.done,
            failed = state.summary.failed,
            blocked = state.summary.blocked.len(),
            "Loop settled"
        );
        self.emit(DispatchEvent::Settled {
            summary: state.summary.clone(),
        })
        .await;
        Ok(state.summary)
    }

    async fn recover(&self, state: &mut LoopState, loop_number: u32) -> Result<(), DispatchError> {
        let stale: Vec<(TaskId, u32, bool)> = state
            .tasks
            .in_progress()
            .map(|t| (t.id.clone(), t.dispatch_count, t.awaiting_redispatch()))
            .collect();

        for (id, dispatch, owed) in stale {
            state.summary.recovered += 1;

            // Its last marker was already applied and scheduled a retry
            if owed {
                info!(task = %id, dispatch, "Recovering task owed a re-dispatch");
                self.emit(DispatchEvent::Recovered {
                    task: id.clone(),
                    outcome: Some(Outcome::Failure),
                })
                .await;
                state.retry_queue.push_back(id);
                continue;
            }

            let key = MarkerKey::new(id.clone(), loop_number, dispatch);
            let peeked = self.gate.peek(&key);
            let outcome = peeked.as_ref().ok().copied().flatten();
            info!(task = %id, dispatch, marker = ?outcome, "Recovering in-progress task");
            self.emit(DispatchEvent::Recovered {
                task: id.clone(),
                outcome,
            })
            .await;

            match peeked {
                Ok(Some(outcome)) => self.resolve(state, key, outcome).await?,
                Ok(None) => state.retry_queue.push_back(id),
                Err(e) => self.resolve_gate_error(state, key, e).await?,
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        state: &mut LoopState,
        id: &TaskId,
        loop_number: u32,
        permit: OwnedSemaphorePermit,
        result_tx: &mpsc::Sender<Resolution>,
    ) -> Result<(), DispatchError> {
        let dispatch = state.tasks.mark_dispatched(id)?;
        self.store.save_tasks(&state.tasks)?;
        let task = state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;

        let key = MarkerKey::new(id.clone(), loop_number, dispatch);
        state.summary.dispatches += 1;
        info!(task = %id, dispatch, "Dispatching");
        self.emit(DispatchEvent::Started {
            task: id.clone(),
            dispatch,
        })
        .await;

        let harness = WorkerHarness::new(Arc::clone(&self.executor), Arc::clone(&self.gate))
            .with_local_test_attempts(self.config.local_test_attempts);
        let worker_key = key.clone();
        tokio::spawn(async move {
            match harness.run(&task, worker_key.clone()).await {
                Ok(published) => debug!(key = %worker_key, ?published, "Worker finished"),
                Err(e) => error!(key = %worker_key, error = %e, "Worker failed to publish"),
            }
        });

        let gate = Arc::clone(&self.gate);
        let budget = self.config.gate_timeout;
        let tx = result_tx.clone();
        tokio::spawn(async move {
            let outcome = wait_for_outcome(gate, &key, budget).await;
            // Free the slot before the scheduler sees the result
            drop(permit);
            tx.send(Resolution { key, outcome }).await.ok();
        });
        Ok(())
    }

    /// Apply an observed outcome to the stores.
    async fn resolve(
        &self,
        state: &mut LoopState,
        key: MarkerKey,
        outcome: Outcome,
    ) -> Result<(), DispatchError> {
        let id = key.task_id.clone();
        match outcome {
            Outcome::Success => {
                state.tasks.record_outcome(&id, Outcome::Success)?;
                state.tasks.mark_resolved(&id, key.dispatch)?;
                info!(task = %id, dispatch = key.dispatch, "Task done");
                self.emit(DispatchEvent::Completed {
                    task: id.clone(),
                    dispatch: key.dispatch,
                    outcome,
                    timed_out: false,
                })
                .await;
                self.complete_source_issue(state, &id)?;
            }
            Outcome::Failure => {
                let report = self.load_report(&key);
                return self.resolve_failure(state, key, report).await;
            }
        }
        self.persist(state)
    }

    /// A gate error for one key fails that dispatch, never the loop.
    async fn resolve_gate_error(
        &self,
        state: &mut LoopState,
        key: MarkerKey,
        err: GateError,
    ) -> Result<(), DispatchError> {
        error!(key = %key, error = %err, "Gate error, failing dispatch");
        let report = match &err {
            GateError::Claimed(_) => FailureReport::timeout(&key, self.config.gate_timeout),
            GateError::ConflictingMarkers(_) => FailureReport::new(
                &key,
                FailureKind::EvidenceTamperDetected,
                RootCause::new("gate_error", &err.to_string(), key.task_id.as_str(), ""),
            ),
            _ => FailureReport::new(
                &key,
                FailureKind::BuildFailure,
                RootCause::new("gate_error", &err.to_string(), key.task_id.as_str(), ""),
            ),
        };
        self.resolve_failure(state, key, report).await
    }

    async fn resolve_failure(
        &self,
        state: &mut LoopState,
        key: MarkerKey,
        report: FailureReport,
    ) -> Result<(), DispatchError> {
        let id = key.task_id.clone();
        let timed_out = report.kind == FailureKind::Timeout;
        if timed_out {
            state.summary.timeouts += 1;
        }
        self.emit(DispatchEvent::Completed {
            task: id.clone(),
            dispatch: key.dispatch,
            outcome: Outcome::Failure,
            timed_out,
        })
        .await;

        let verdict = {
            let task = state.tasks.task_mut(&id)?;
            self.engine
                .on_failure(task, &report, &mut state.issues, key.loop_number)?
        };
        state.tasks.mark_resolved(&id, key.dispatch)?;

        let event = match (verdict.state, verdict.issue.clone()) {
            (RetryState::Attempting(retry), _) => {
                state.summary.retries += 1;
                state.retry_queue.push_back(id.clone());
                DispatchEvent::Retrying {
                    task: id.clone(),
                    retry,
                }
            }
            (terminal, Some(issue)) => {
                state.tasks.record_outcome(&id, Outcome::Failure)?;
                if terminal == RetryState::Halted {
                    state.summary.halted.push(issue.clone());
                } else {
                    state.summary.issues_raised.push(issue.clone());
                }
                match terminal {
                    RetryState::Halted => DispatchEvent::Halted {
                        task: id.clone(),
                        issue,
                    },
                    RetryState::Escalated => DispatchEvent::Escalated {
                        task: id.clone(),
                        issue,
                    },
                    _ => DispatchEvent::Exhausted {
                        task: id.clone(),
                        issue,
                    },
                }
            }
            (terminal, None) => {
                // Every terminal verdict raises or halts an issue
                warn!(task = %id, state = %terminal, "Terminal verdict without an issue");
                state.tasks.record_outcome(&id, Outcome::Failure)?;
                return self.persist(state);
            }
        };
        self.emit(event).await;
        self.persist(state)
    }

    fn load_report(&self, key: &MarkerKey) -> FailureReport {
        let (cause, error) = match read_report(self.gate.loops_root(), key) {
            Ok(Some(report)) => return report,
            Ok(None) => {
                warn!(key = %key, "Failure marker without a report");
                (
                    "missing_report",
                    "failure marker published without a failure report".to_string(),
                )
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable failure report");
                ("unreadable_report", e.to_string())
            }
        };
        FailureReport::new(
            key,
            FailureKind::BuildFailure,
            RootCause::new(cause, &error, key.task_id.as_str(), ""),
        )
    }

    /// A successful remediation task completes the issue it came from.
    fn complete_source_issue(&self, state: &mut LoopState, id: &TaskId) -> Result<(), DispatchError> {
        let Some(task) = state.tasks.get(id) else {
            return Ok(());
        };
        if task.kind != TaskKind::Remediation {
            return Ok(());
        }
        let Some(issue) = task.source_issue.clone() else {
            return Ok(());
        };
        match state.issues.mark_completed(&issue) {
            Ok(()) => {
                info!(task = %id, issue = %issue, "Issue completed");
                Ok(())
            }
            Err(StoreError::IssueHalted(_)) => {
                warn!(task = %id, issue = %issue, "Remediation succeeded but issue is halted");
                Ok(())
            }
            Err(StoreError::IssueNotFound(_)) => {
                warn!(task = %id, issue = %issue, "Source issue no longer exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, state: &LoopState) -> Result<(), DispatchError> {
        self.store.save_tasks(&state.tasks)?;
        self.store.save_issues(&state.issues)?;
        Ok(())
    }

    /// Emit an event to the event channel if configured.
    async fn emit(&self, event: DispatchEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Wait on the gate; on timeout publish a synthetic failure on the worker's
/// behalf. If the worker won that race its marker is the outcome.
///
/// A worker holding the claim without a marker yet gets one short grace
/// wait; after that the key is reported as `Claimed`.
async fn wait_for_outcome(
    gate: Arc<CompletionGate>,
    key: &MarkerKey,
    budget: Duration,
) -> Result<Outcome, GateError> {
    match gate.await_outcome(key, budget).await? {
        GateOutcome::Success => return Ok(Outcome::Success),
        GateOutcome::Failure => return Ok(Outcome::Failure),
        GateOutcome::Timeout => {}
    }

    warn!(key = %key, budget_secs = budget.as_secs(), "Worker timed out; abandoning it");
    let report = FailureReport::timeout(key, budget);
    match publish_blocking(Arc::clone(&gate), key.clone(), Outcome::Failure, Some(report)).await? {
        Publication::Published(outcome) | Publication::Resolved(outcome) => Ok(outcome),
        Publication::Claimed => {
            let grace = CLAIM_GRACE.min(budget);
            debug!(key = %key, grace_ms = grace.as_millis() as u64, "Waiting on claimed marker");
            match gate.await_outcome(key, grace).await? {
                GateOutcome::Success => Ok(Outcome::Success),
                GateOutcome::Failure => Ok(Outcome::Failure),
                GateOutcome::Timeout => Err(GateError::Claimed(key.clone())),
            }
        }
    }
}
