//! End-to-end orchestration scenarios: decompose a source, persist the
//! batch and drive it through the dispatcher with scripted workers.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use foreman::decomposition::{DecompositionConfig, DecompositionEngine, EXHAUSTED_HALT_REASON};
use foreman::dispatch::{
    AttemptContext, AttemptFailure, AttemptResult, DispatchConfig, Dispatcher, TaskExecutor,
    WorkerHarness,
};
use foreman::errors::DecompositionError;
use foreman::gate::{CompletionGate, MarkerKey, Outcome, Publication};
use foreman::mode::{Mode, ModeController, TriggerContext};
use foreman::retry::{FailureKind, RetryPolicy, RootCause};
use foreman::store::{
    IssueStatus, Store, Task, TaskId, TaskKind, TaskStatus, TaskStore,
};

type Script = dyn Fn(&Task, &AttemptContext) -> AttemptResult + Send + Sync;

/// Worker whose result is a function of the task and attempt.
struct ScriptedWorker {
    script: Box<Script>,
    calls: Mutex<Vec<(TaskId, u32)>>,
}

impl ScriptedWorker {
    fn new(script: impl Fn(&Task, &AttemptContext) -> AttemptResult + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn passing() -> Self {
        Self::new(|_, _| AttemptResult::Passed)
    }

    fn order(&self) -> Vec<TaskId> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    fn dispatches_of(&self, id: &TaskId) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(task, _)| task == id)
            .map(|(_, dispatch)| *dispatch)
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedWorker {
    async fn attempt(&self, task: &Task, ctx: &AttemptContext) -> Result<AttemptResult> {
        self.calls.lock().unwrap().push((task.id.clone(), ctx.dispatch));
        Ok((self.script)(task, ctx))
    }
}

fn failure(kind: FailureKind, error: &str, task: &Task) -> AttemptResult {
    AttemptResult::Failed(AttemptFailure::new(
        kind,
        RootCause::new("assertion", error, task.id.as_str(), "src/lib.rs"),
    ))
}

fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        max_parallel: 3,
        gate_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(10),
        local_test_attempts: 1,
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        signature_repeat_threshold: 3,
    }
}

/// Select a mode for the next loop, decompose it and persist the batch.
fn plan_next(
    store: &Store,
    engine: &DecompositionEngine,
    requirements: Option<&Path>,
    test_plan: Option<&Path>,
) -> Result<u32, DecompositionError> {
    let mut issues = store.load_issues()?;
    let prior = store.loops()?;
    let loop_number = prior.last().map_or(1, |n| n + 1);
    let ctx = TriggerContext::new()
        .with_requirements(requirements.map(Path::to_path_buf))
        .with_test_plan(test_plan.map(Path::to_path_buf))
        .with_critical_backlog(issues.critical_backlog().len())
        .with_prior_loops(prior.len());
    let selection = ModeController::select(&ctx)?;

    let batch = match engine.decompose(&selection, loop_number, &mut issues) {
        Ok(batch) => batch,
        Err(e) => {
            store.save_issues(&issues)?;
            return Err(e);
        }
    };

    let mut tasks = TaskStore::new(loop_number);
    tasks.insert_batch(batch.tasks)?;
    store.save_plan(&tasks, &issues)?;
    Ok(loop_number)
}

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

const TWO_FEATURES: &str = r#"
[[features]]
name = "Storage"
build = ["Schema", "Migrations"]
tests = ["STORE-001", "STORE-002", "STORE-003"]

[[features]]
name = "Search"
build = ["Index"]
tests = ["SRCH-001"]
"#;

mod planning_and_dispatch {
    use super::*;

    #[tokio::test]
    async fn test_initial_loop_runs_tests_before_builds() {
        let dir = TempDir::new().unwrap();
        let requirements = write(&dir, "requirements.toml", TWO_FEATURES);
        let store = Store::open(dir.path().join(".orchestrator")).unwrap();
        let engine = DecompositionEngine::new(DecompositionConfig::default());

        let loop_number = plan_next(&store, &engine, Some(&requirements), None).unwrap();
        assert_eq!(loop_number, 1);

        let worker = Arc::new(ScriptedWorker::passing());
        let dispatcher = Dispatcher::new(store.clone(), worker.clone(), dispatch_config(), policy());
        let summary = dispatcher.run_loop(1).await.unwrap();

        assert!(summary.all_success());
        assert_eq!(summary.total, 6);

        let tasks = store.load_tasks(1).unwrap();
        let order = worker.order();
        let pos = |id: &TaskId| order.iter().position(|seen| seen == id).unwrap();
        for task in tasks.tasks().filter(|t| t.kind == TaskKind::Build) {
            for dep in &task.dependencies {
                assert!(pos(dep) < pos(&task.id), "{} ran before {}", task.id, dep);
            }
        }
        assert_eq!(order.last(), Some(&TaskId::verification()));
    }

    #[tokio::test]
    async fn test_failed_test_task_blocks_only_its_feature() {
        let dir = TempDir::new().unwrap();
        let requirements = write(&dir, "requirements.toml", TWO_FEATURES);
        let store = Store::open(dir.path().join(".orchestrator")).unwrap();
        let engine = DecompositionEngine::new(DecompositionConfig::default());
        plan_next(&store, &engine, Some(&requirements), None).unwrap();

        // Storage's single test task fails to compile
        let storage_tests = TaskId::test_batch(1);
        let failing = storage_tests.clone();
        let worker = Arc::new(ScriptedWorker::new(move |task, _| {
            if task.id == failing {
                failure(FailureKind::BuildFailure, "E0432 unresolved import", task)
            } else {
                AttemptResult::Passed
            }
        }));
        let dispatcher = Dispatcher::new(store.clone(), worker.clone(), dispatch_config(), policy());
        let summary = dispatcher.run_loop(1).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.issues_raised.len(), 1);
        assert_eq!(
            summary.blocked,
            vec![TaskId::build(1), TaskId::build(2), TaskId::verification()]
        );

        let tasks = store.load_tasks(1).unwrap();
        assert_eq!(tasks.get(&TaskId::build(3)).unwrap().status, TaskStatus::Done);
        assert_eq!(tasks.get(&TaskId::build(1)).unwrap().dispatch_count, 0);
        assert_eq!(worker.dispatches_of(&storage_tests), vec![1]);
    }

    #[tokio::test]
    async fn test_external_plan_covers_every_identifier() {
        let dir = TempDir::new().unwrap();
        let mut plan = String::from("# Acceptance plan\n");
        for (category, prefix, count) in [
            ("Parsing", "PARSE", 15),
            ("Storage", "STORE", 14),
            ("Network", "NET", 13),
            ("Auth", "AUTH", 12),
            ("Search", "SRCH", 12),
            ("Export", "EXP", 10),
        ] {
            plan.push_str(&format!("\n## {}\n\n", category));
            for n in 1..=count {
                plan.push_str(&format!("- {}-{:03}: behaves\n", prefix, n));
            }
        }
        let plan_path = write(&dir, "test-plan.md", &plan);
        let store = Store::open(dir.path().join(".orchestrator")).unwrap();
        let engine = DecompositionEngine::new(DecompositionConfig::default().set_max_tests_per_task(10));

        plan_next(&store, &engine, None, Some(&plan_path)).unwrap();
        let tasks = store.load_tasks(1).unwrap();

        let test_tasks: Vec<&Task> = tasks.tasks().filter(|t| t.kind == TaskKind::Test).collect();
        assert_eq!(test_tasks.len(), 11);
        let covered: BTreeSet<String> = test_tasks
            .iter()
            .flat_map(|t| t.test_ids.iter().cloned())
            .collect();
        assert_eq!(covered.len(), 76);
        assert_eq!(
            test_tasks.iter().map(|t| t.test_ids.len()).sum::<usize>(),
            76
        );

        let worker = Arc::new(ScriptedWorker::passing());
        let dispatcher = Dispatcher::new(store.clone(), worker, dispatch_config(), policy());
        let summary = dispatcher.run_loop(1).await.unwrap();
        assert!(summary.all_success());
    }

    #[tokio::test]
    async fn test_restarted_controller_applies_published_marker() {
        let dir = TempDir::new().unwrap();
        let requirements = write(&dir, "requirements.toml", TWO_FEATURES);
        let store = Store::open(dir.path().join(".orchestrator")).unwrap();
        let engine = DecompositionEngine::new(DecompositionConfig::default());
        plan_next(&store, &engine, Some(&requirements), None).unwrap();

        // A controller dispatched TASK-T01 and died; its worker finished later.
        let mut tasks = store.load_tasks(1).unwrap();
        let dispatch = tasks.mark_dispatched(&TaskId::test_batch(1)).unwrap();
        store.save_tasks(&tasks).unwrap();
        let gate = Arc::new(CompletionGate::new(store.loops_root(), Duration::from_millis(10)));
        let task = tasks.get(&TaskId::test_batch(1)).unwrap().clone();
        let published = WorkerHarness::new(Arc::new(ScriptedWorker::passing()), gate)
            .run(&task, MarkerKey::new(task.id.clone(), 1, dispatch))
            .await
            .unwrap();
        assert_eq!(published, Publication::Published(Outcome::Success));

        let worker = Arc::new(ScriptedWorker::passing());
        let dispatcher = Dispatcher::new(store.clone(), worker.clone(), dispatch_config(), policy());
        let summary = dispatcher.run_loop(1).await.unwrap();

        assert_eq!(summary.recovered, 1);
        assert!(summary.all_success());
        assert!(worker.dispatches_of(&TaskId::test_batch(1)).is_empty());
    }
}

mod retry_signatures {
    use super::*;
    use foreman::store::RetryLedger;

    fn single_task_store(dir: &TempDir, max_retries: u32) -> Store {
        let store = Store::open(dir.path()).unwrap();
        let mut tasks = TaskStore::new(1);
        tasks
            .insert_batch(vec![
                Task::new(TaskId::build(1), TaskKind::Build, "Parser", "core")
                    .with_ledger(RetryLedger::with_max_retries(max_retries)),
            ])
            .unwrap();
        store.save_tasks(&tasks).unwrap();
        store
    }

    #[tokio::test]
    async fn test_alternating_signatures_do_not_halt() {
        let dir = TempDir::new().unwrap();
        let store = single_task_store(&dir, 5);
        let worker = Arc::new(ScriptedWorker::new(|task, ctx| match ctx.dispatch {
            1 | 3 => failure(FailureKind::TestFailure, "expected 3, got 4", task),
            2 => failure(FailureKind::TestFailure, "index out of bounds", task),
            _ => AttemptResult::Passed,
        }));
        let dispatcher = Dispatcher::new(store.clone(), worker.clone(), dispatch_config(), policy());

        let summary = dispatcher.run_loop(1).await.unwrap();
        assert!(summary.all_success());
        assert!(summary.halted.is_empty());
        assert_eq!(summary.retries, 3);
        assert_eq!(worker.dispatches_of(&TaskId::build(1)), vec![1, 2, 3, 4]);

        let task = store.load_tasks(1).unwrap().get(&TaskId::build(1)).unwrap().clone();
        assert_eq!(task.ledger.signature_repeat_count, 1);
        assert_eq!(task.ledger.previous_signatures.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_signature_halts_before_budget() {
        let dir = TempDir::new().unwrap();
        let store = single_task_store(&dir, 10);
        let worker = Arc::new(ScriptedWorker::new(|task, _| {
            failure(FailureKind::TestFailure, "expected 3, got 4", task)
        }));
        let dispatcher = Dispatcher::new(store.clone(), worker.clone(), dispatch_config(), policy());

        let summary = dispatcher.run_loop(1).await.unwrap();
        assert_eq!(summary.dispatches, 3);
        assert_eq!(summary.halted.len(), 1);
        assert_eq!(summary.failed, 1);

        let issues = store.load_issues().unwrap();
        let issue = issues.get(&summary.halted[0]).unwrap();
        assert_eq!(issue.status, IssueStatus::Halted);
        assert!(issue.halted);
        assert!(issue.halt_reason.as_deref().unwrap().contains("repeated 3 times"));
    }
}

mod improvement_cycles {
    use super::*;

    const ONE_FEATURE: &str = r#"
[[features]]
name = "Export"
build = ["CSV writer"]
tests = ["EXP-001", "EXP-002"]
"#;

    #[tokio::test]
    async fn test_escalated_issue_is_remediated_next_loop() {
        let dir = TempDir::new().unwrap();
        let requirements = write(&dir, "requirements.toml", ONE_FEATURE);
        let store = Store::open(dir.path().join(".orchestrator")).unwrap();
        let engine = DecompositionEngine::new(DecompositionConfig::default());
        plan_next(&store, &engine, Some(&requirements), None).unwrap();

        let build = TaskId::build(1);
        let failing = build.clone();
        let worker = Arc::new(ScriptedWorker::new(move |task, _| {
            if task.id == failing {
                failure(FailureKind::TypeFailure, "E0308 mismatched types", task)
            } else {
                AttemptResult::Passed
            }
        }));
        let summary = Dispatcher::new(store.clone(), worker, dispatch_config(), policy())
            .run_loop(1)
            .await
            .unwrap();
        assert_eq!(summary.issues_raised.len(), 1);
        let issue_id = summary.issues_raised[0].clone();

        let loop_number = plan_next(&store, &engine, Some(&requirements), None).unwrap();
        assert_eq!(loop_number, 2);
        let issues = store.load_issues().unwrap();
        assert_eq!(issues.get(&issue_id).unwrap().status, IssueStatus::InProgress);

        let tasks = store.load_tasks(2).unwrap();
        let remediation = tasks
            .tasks()
            .find(|t| t.kind == TaskKind::Remediation)
            .unwrap();
        assert_eq!(remediation.source_issue.as_ref(), Some(&issue_id));

        let summary = Dispatcher::new(store.clone(), Arc::new(ScriptedWorker::passing()), dispatch_config(), policy())
            .run_loop(2)
            .await
            .unwrap();
        assert!(summary.all_success());
        let issues = store.load_issues().unwrap();
        assert_eq!(issues.get(&issue_id).unwrap().status, IssueStatus::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_issue_is_halted_at_next_decomposition() {
        let dir = TempDir::new().unwrap();
        let requirements = write(&dir, "requirements.toml", ONE_FEATURE);
        let store = Store::open(dir.path().join(".orchestrator")).unwrap();
        let engine = DecompositionEngine::new(DecompositionConfig::default().set_max_retries(2));
        plan_next(&store, &engine, Some(&requirements), None).unwrap();

        // A different assertion each dispatch: the budget runs out, no halt
        let build = TaskId::build(1);
        let failing = build.clone();
        let worker = Arc::new(ScriptedWorker::new(move |task, ctx| {
            if task.id == failing {
                failure(
                    FailureKind::TestFailure,
                    &format!("assertion {} failed", ctx.dispatch),
                    task,
                )
            } else {
                AttemptResult::Passed
            }
        }));
        let summary = Dispatcher::new(store.clone(), worker, dispatch_config(), policy())
            .run_loop(1)
            .await
            .unwrap();
        assert!(summary.halted.is_empty());
        assert_eq!(summary.issues_raised.len(), 1);
        let issue_id = summary.issues_raised[0].clone();

        let err = plan_next(&store, &engine, Some(&requirements), None).unwrap_err();
        assert!(matches!(err, DecompositionError::EmptySource(_)));

        let issues = store.load_issues().unwrap();
        let issue = issues.get(&issue_id).unwrap();
        assert_eq!(issue.status, IssueStatus::Halted);
        assert_eq!(issue.halt_reason.as_deref(), Some(EXHAUSTED_HALT_REASON));
        assert_eq!(store.loops().unwrap(), vec![1]);
    }

    #[test]
    fn test_critical_backlog_selects_critical_only() {
        let ctx = TriggerContext::new()
            .with_critical_backlog(2)
            .with_prior_loops(3);
        assert_eq!(ModeController::select(&ctx).unwrap().mode, Mode::CriticalOnly);
    }
}
