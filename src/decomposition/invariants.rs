//! Checks every batch must pass before it reaches the task store.

use std::collections::{BTreeMap, BTreeSet};

use crate::dag::TaskGraph;
use crate::errors::DecompositionError;
use crate::store::{Task, TaskId, TaskKind};

/// The batch forms a DAG with no dangling or duplicate ids.
pub fn validate_dag(tasks: &[Task]) -> Result<(), DecompositionError> {
    TaskGraph::build(tasks)?;
    Ok(())
}

/// Every build or remediation task depends on at least one root test task.
pub fn check_tdd(tasks: &[Task]) -> Result<(), DecompositionError> {
    let root_tests: BTreeSet<&TaskId> = tasks
        .iter()
        .filter(|t| t.is_root_test())
        .map(|t| &t.id)
        .collect();

    for task in tasks.iter().filter(|t| t.kind.requires_tests()) {
        if !task.dependencies.iter().any(|d| root_tests.contains(d)) {
            return Err(DecompositionError::TddViolation {
                task: task.id.to_string(),
            });
        }
    }
    Ok(())
}

/// The test tasks cover `expected` exactly once each.
pub fn check_coverage(
    expected: &BTreeSet<String>,
    tasks: &[Task],
) -> Result<(), DecompositionError> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for task in tasks.iter().filter(|t| t.kind == TaskKind::Test) {
        for id in &task.test_ids {
            *counts.entry(id.as_str()).or_default() += 1;
        }
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !counts.contains_key(id.as_str()))
        .cloned()
        .collect();
    let duplicated: Vec<String> = counts
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    let unexpected: Vec<String> = counts
        .keys()
        .filter(|id| !expected.contains(**id))
        .map(|id| id.to_string())
        .collect();

    if missing.is_empty() && duplicated.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(DecompositionError::CoverageMismatch {
            missing,
            duplicated,
            unexpected,
        })
    }
}
