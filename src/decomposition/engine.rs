//! Batch construction for each mode.
//!
//! Every batch leaves here as a DAG in which each build or remediation task
//! depends on a root test task, and which ends in the `TASK-99999`
//! verification sink.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::config::{DecompositionConfig, MAX_BUILD_TASKS, MAX_TEST_TASKS};
use super::invariants::{check_coverage, check_tdd, validate_dag};
use super::source::{Requirements, TestPlan};
use crate::errors::DecompositionError;
use crate::mode::{Mode, ModeSelection, SourceDocument};
use crate::store::{
    Issue, IssueId, IssueStore, RetryLedger, Task, TaskId, TaskKind, TaskIdKind,
};

/// Category of remediation work derived from issues.
pub const REMEDIATION_CATEGORY: &str = "remediation";

/// Reason recorded on issues halted for spending their budget across cycles.
pub const EXHAUSTED_HALT_REASON: &str = "retry budget exhausted across cycles";

/// One decomposition result, ready for `TaskStore::insert_batch`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub loop_number: u32,
    /// `None` for a batch imported from an edited queue.
    pub mode: Option<Mode>,
    pub tasks: Vec<Task>,
    /// Issues marked `in_progress` by this batch.
    pub consumed_issues: Vec<IssueId>,
    /// Issues halted instead of decomposed.
    pub halted_issues: Vec<IssueId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn test_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.kind == TaskKind::Test)
    }

    /// Union of the test identifiers of every test task.
    pub fn covered_test_ids(&self) -> BTreeSet<String> {
        self.test_tasks()
            .flat_map(|t| t.test_ids.iter().cloned())
            .collect()
    }

    pub fn verification(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.id.kind() == TaskIdKind::Verification)
    }
}

/// Hands out ids in the two numbered spaces.
#[derive(Debug, Default)]
struct IdAllocator {
    tests: u32,
    builds: u32,
}

impl IdAllocator {
    fn test(&mut self) -> Result<TaskId, DecompositionError> {
        if self.tests >= MAX_TEST_TASKS {
            return Err(DecompositionError::IdSpaceExhausted {
                kind: "test batch",
                limit: MAX_TEST_TASKS,
            });
        }
        self.tests += 1;
        Ok(TaskId::test_batch(self.tests))
    }

    fn build(&mut self) -> Result<TaskId, DecompositionError> {
        if self.builds >= MAX_BUILD_TASKS {
            return Err(DecompositionError::IdSpaceExhausted {
                kind: "build",
                limit: MAX_BUILD_TASKS,
            });
        }
        self.builds += 1;
        Ok(TaskId::build(self.builds))
    }
}

pub struct DecompositionEngine {
    config: DecompositionConfig,
}

impl DecompositionEngine {
    pub fn new(config: DecompositionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecompositionConfig {
        &self.config
    }

    /// Read the selected source and build the batch for `loop_number`.
    pub fn decompose(
        &self,
        selection: &ModeSelection,
        loop_number: u32,
        issues: &mut IssueStore,
    ) -> Result<Batch, DecompositionError> {
        info!(
            mode = %selection.mode,
            source = %selection.source,
            reason = selection.reason,
            loop_number,
            "Decomposing"
        );
        match &selection.source {
            SourceDocument::Requirements(path) => {
                self.from_requirements(&Requirements::load(path)?, loop_number)
            }
            SourceDocument::TestPlan(path) => {
                self.from_test_plan(&TestPlan::load(path)?, loop_number)
            }
            SourceDocument::IssueBacklog => self.from_issues(selection.mode, loop_number, issues),
        }
    }

    /// `initial`: test tasks per feature, then build tasks behind them.
    pub fn from_requirements(
        &self,
        requirements: &Requirements,
        loop_number: u32,
    ) -> Result<Batch, DecompositionError> {
        if requirements.features.is_empty() {
            return Err(DecompositionError::EmptySource(
                "requirements declare no features".into(),
            ));
        }

        let mut ids = IdAllocator::default();
        let mut tasks = Vec::new();

        let mut feature_tests: Vec<Vec<TaskId>> = Vec::with_capacity(requirements.features.len());
        for feature in &requirements.features {
            if feature.tests.is_empty() {
                return Err(DecompositionError::FeatureWithoutTests(feature.name.clone()));
            }
            let category = feature.category();
            let complexity = feature.complexity.unwrap_or(self.config.default_complexity);
            let chunks = self.chunk(&feature.tests);
            let total = chunks.len();
            let mut test_ids = Vec::with_capacity(total);
            for (i, chunk) in chunks.into_iter().enumerate() {
                let id = ids.test()?;
                let mut task = Task::test(
                    id.clone(),
                    &chunk_title(&feature.name, i, total),
                    &category,
                    chunk,
                )
                .with_complexity(complexity)
                .with_ledger(self.ledger());
                if let Some(level) = feature.integration_level {
                    task.integration_level = Some(level);
                }
                if let Some(policy) = feature.mock_policy {
                    task.mock_policy = Some(policy);
                }
                test_ids.push(id);
                tasks.push(task);
            }
            feature_tests.push(test_ids);
        }

        // Allocate every build id first so `depends_on` may point forward.
        let mut feature_builds: Vec<Vec<(TaskId, String)>> = Vec::new();
        let mut builds_by_name: BTreeMap<&str, Vec<TaskId>> = BTreeMap::new();
        for feature in &requirements.features {
            let items = if feature.build.is_empty() {
                vec![format!("Implement {}", feature.name)]
            } else {
                feature.build.clone()
            };
            let mut allocated = Vec::with_capacity(items.len());
            for item in items {
                allocated.push((ids.build()?, item));
            }
            builds_by_name.insert(
                feature.name.as_str(),
                allocated.iter().map(|(id, _)| id.clone()).collect(),
            );
            feature_builds.push(allocated);
        }

        for ((feature, tests), builds) in requirements
            .features
            .iter()
            .zip(&feature_tests)
            .zip(feature_builds)
        {
            let mut deps: BTreeSet<TaskId> = tests.iter().cloned().collect();
            for upstream in &feature.depends_on {
                let upstream_builds = builds_by_name.get(upstream.as_str()).ok_or_else(|| {
                    DecompositionError::UnknownFeature {
                        feature: feature.name.clone(),
                        dependency: upstream.clone(),
                    }
                })?;
                deps.extend(upstream_builds.iter().cloned());
            }

            let category = feature.category();
            let complexity = feature.complexity.unwrap_or(self.config.default_complexity);
            for (id, item) in builds {
                let task = Task::new(id, TaskKind::Build, &item, &category)
                    .with_description(feature.description.as_deref().unwrap_or_default())
                    .with_complexity(complexity)
                    .with_dependencies(deps.iter().cloned())
                    .with_ledger(self.ledger());
                tasks.push(task);
            }
        }

        self.finalize(
            tasks,
            Some(Mode::Initial),
            loop_number,
            Some(&requirements.test_ids()),
        )
    }

    /// `external_spec`: test tasks per category with exact coverage.
    pub fn from_test_plan(
        &self,
        plan: &TestPlan,
        loop_number: u32,
    ) -> Result<Batch, DecompositionError> {
        if plan.total() == 0 {
            return Err(DecompositionError::EmptySource(format!(
                "test plan {} lists no test identifiers",
                plan.path.display()
            )));
        }

        let mut ids = IdAllocator::default();
        let mut tasks = Vec::new();
        for category in &plan.categories {
            let slug = category.slug();
            let chunks = self.chunk(&category.ids);
            let total = chunks.len();
            let mut tests = Vec::with_capacity(total);
            for (i, chunk) in chunks.into_iter().enumerate() {
                let id = ids.test()?;
                tasks.push(
                    Task::test(id.clone(), &chunk_title(&category.name, i, total), &slug, chunk)
                        .with_complexity(self.config.default_complexity)
                        .with_ledger(self.ledger()),
                );
                tests.push(id);
            }
            tasks.push(
                Task::new(
                    ids.build()?,
                    TaskKind::Build,
                    &format!("Implement {}", category.name),
                    &slug,
                )
                .with_complexity(self.config.default_complexity)
                .with_dependencies(tests)
                .with_ledger(self.ledger()),
            );
        }

        self.finalize(
            tasks,
            Some(Mode::ExternalSpec),
            loop_number,
            Some(&plan.all_ids()),
        )
    }

    /// `critical_only` and `improvement_loop`: one regression test and one
    /// remediation task per issue.
    ///
    /// Issues that already spent their retry budget are halted instead.
    pub fn from_issues(
        &self,
        mode: Mode,
        loop_number: u32,
        issues: &mut IssueStore,
    ) -> Result<Batch, DecompositionError> {
        let candidates: Vec<Issue> = match mode {
            Mode::CriticalOnly => issues.critical_backlog(),
            _ => issues.open_backlog(),
        }
        .into_iter()
        .cloned()
        .collect();

        if candidates.is_empty() {
            return Err(DecompositionError::EmptySource(format!(
                "no decomposable issues for {}",
                mode
            )));
        }

        let mut ids = IdAllocator::default();
        let mut tasks = Vec::new();
        let mut consumed = Vec::new();
        let mut exhausted = Vec::new();

        for issue in &candidates {
            if !issue.ledger.has_budget() {
                exhausted.push(issue.id.clone());
                continue;
            }

            let test_id = ids.test()?;
            tasks.push(
                Task::test(
                    test_id.clone(),
                    &format!("Regression test for {}", issue.id),
                    REMEDIATION_CATEGORY,
                    BTreeSet::from([issue.id.to_string()]),
                )
                .with_description(&issue.root_cause)
                .with_ledger(self.ledger()),
            );
            tasks.push(
                Task::new(
                    ids.build()?,
                    TaskKind::Remediation,
                    &issue.title,
                    REMEDIATION_CATEGORY,
                )
                .with_description(&issue.root_cause)
                .with_complexity(self.config.default_complexity)
                .with_dependencies([test_id])
                .with_ledger(issue.ledger.clone())
                .with_source_issue(issue.id.clone()),
            );
            consumed.push(issue.id.clone());
        }

        for id in &exhausted {
            issues.halt(id, EXHAUSTED_HALT_REASON)?;
        }
        if tasks.is_empty() {
            return Err(DecompositionError::EmptySource(format!(
                "all {} candidate issues were halted",
                exhausted.len()
            )));
        }

        let mut batch = self.finalize(tasks, Some(mode), loop_number, None)?;
        for id in &consumed {
            issues.mark_in_progress(id)?;
        }
        batch.consumed_issues = consumed;
        batch.halted_issues = exhausted;
        Ok(batch)
    }

    /// Re-validate a hand-edited queue. Any verification task in it is
    /// replaced with a fresh one depending on the whole batch.
    pub fn from_queue(
        &self,
        tasks: Vec<Task>,
        loop_number: u32,
    ) -> Result<Batch, DecompositionError> {
        let tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.id.kind() != TaskIdKind::Verification)
            .collect();
        if tasks.is_empty() {
            return Err(DecompositionError::EmptySource("queue lists no tasks".into()));
        }
        self.finalize(tasks, None, loop_number, None)
    }

    fn finalize(
        &self,
        mut tasks: Vec<Task>,
        mode: Option<Mode>,
        loop_number: u32,
        expected_tests: Option<&BTreeSet<String>>,
    ) -> Result<Batch, DecompositionError> {
        if let Some(expected) = expected_tests {
            check_coverage(expected, &tasks)?;
        }
        check_tdd(&tasks)?;

        let all: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        tasks.push(
            Task::new(
                TaskId::verification(),
                TaskKind::Verification,
                &format!("Verify loop {}", loop_number),
                "verification",
            )
            .with_dependencies(all)
            .with_ledger(self.ledger()),
        );
        validate_dag(&tasks)?;

        info!(
            loop_number,
            mode = mode.map(|m| m.as_str()).unwrap_or("queue"),
            tasks = tasks.len(),
            "Batch ready"
        );
        Ok(Batch {
            loop_number,
            mode,
            tasks,
            consumed_issues: Vec::new(),
            halted_issues: Vec::new(),
        })
    }

    /// Split identifiers into task-sized sets, dropping repeats.
    fn chunk(&self, ids: &[String]) -> Vec<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let unique: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        if unique.len() < ids.len() {
            debug!(
                dropped = ids.len() - unique.len(),
                "Dropped repeated test identifiers"
            );
        }
        unique
            .chunks(self.config.max_tests_per_task.max(1))
            .map(|c| c.iter().map(|id| id.to_string()).collect())
            .collect()
    }

    fn ledger(&self) -> RetryLedger {
        RetryLedger::with_max_retries(self.config.max_retries)
    }
}

fn chunk_title(name: &str, index: usize, total: usize) -> String {
    if total == 1 {
        format!("Tests: {}", name)
    } else {
        format!("Tests: {} ({}/{})", name, index + 1, total)
    }
}
