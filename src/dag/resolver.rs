//! Ready-set computation over a task store snapshot.
//!
//! A task is ready when it is `pending` and every dependency is `done`.
//! The store guarantees a DAG at insertion, so nothing here re-validates.

use std::collections::HashSet;

use crate::store::{Task, TaskId, TaskStatus, TaskStore};

/// Read-only view answering scheduling questions about one loop.
pub struct DependencyResolver<'a> {
    store: &'a TaskStore,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(store: &'a TaskStore) -> Self {
        Self { store }
    }

    /// Pending tasks whose dependencies are all done. No order is implied.
    pub fn ready(&self) -> Vec<&'a Task> {
        self.store
            .tasks()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| self.dependencies_done(task))
            .collect()
    }

    /// Pending tasks that can never become ready in this loop because a
    /// dependency failed, directly or transitively.
    pub fn blocked(&self) -> Vec<&'a Task> {
        let mut doomed: HashSet<&TaskId> = self
            .store
            .tasks()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| &t.id)
            .collect();

        // Fixpoint over the DAG; at most one pass per level.
        loop {
            let newly: Vec<&TaskId> = self
                .store
                .tasks()
                .filter(|t| t.status == TaskStatus::Pending && !doomed.contains(&t.id))
                .filter(|t| t.dependencies.iter().any(|d| doomed.contains(d)))
                .map(|t| &t.id)
                .collect();
            if newly.is_empty() {
                break;
            }
            doomed.extend(newly);
        }

        self.store
            .tasks()
            .filter(|t| t.status == TaskStatus::Pending && doomed.contains(&t.id))
            .collect()
    }

    /// No task is ready and none is running: the loop can make no progress.
    pub fn is_settled(&self) -> bool {
        self.store.in_progress().next().is_none() && self.ready().is_empty()
    }

    /// Layered execution plan: each wave can run once all earlier waves are done.
    ///
    /// Tasks already done are treated as satisfied and omitted.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let mut waves = Vec::new();
        let mut satisfied: HashSet<&TaskId> = self
            .store
            .tasks()
            .filter(|t| t.status.is_success())
            .map(|t| &t.id)
            .collect();

        loop {
            let wave: Vec<&TaskId> = self
                .store
                .tasks()
                .filter(|t| !satisfied.contains(&t.id) && t.status != TaskStatus::Failed)
                .filter(|t| t.dependencies.iter().all(|d| satisfied.contains(d)))
                .map(|t| &t.id)
                .collect();

            if wave.is_empty() {
                break;
            }
            satisfied.extend(wave.iter().copied());
            waves.push(wave.into_iter().cloned().collect());
        }

        waves
    }

    /// Share of tasks in a terminal state, as a percentage.
    pub fn completion_percentage(&self) -> f64 {
        if self.store.is_empty() {
            return 100.0;
        }
        let terminal = self.store.tasks().filter(|t| t.status.is_terminal()).count();
        (terminal as f64 / self.store.len() as f64) * 100.0
    }

    fn dependencies_done(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.store.get(dep).is_some_and(|d| d.status.is_success()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Outcome;
    use crate::store::TaskKind;

    fn task(n: u32, deps: &[u32]) -> Task {
        Task::new(TaskId::build(n), TaskKind::Build, &format!("Task {}", n), "core")
            .with_dependencies(deps.iter().map(|d| TaskId::build(*d)))
    }

    fn store(tasks: Vec<Task>) -> TaskStore {
        let mut store = TaskStore::new(1);
        store.insert_batch(tasks).unwrap();
        store
    }

    fn finish(store: &mut TaskStore, n: u32, outcome: Outcome) {
        store.mark_dispatched(&TaskId::build(n)).unwrap();
        store.record_outcome(&TaskId::build(n), outcome).unwrap();
    }

    fn ids(tasks: Vec<&Task>) -> Vec<String> {
        tasks.iter().map(|t| t.id.to_string()).collect()
    }

    #[test]
    fn test_empty_dependencies_are_immediately_ready() {
        let s = store(vec![task(1, &[]), task(2, &[]), task(3, &[1])]);
        assert_eq!(
            ids(DependencyResolver::new(&s).ready()),
            vec!["TASK-001", "TASK-002"]
        );
    }

    #[test]
    fn test_ready_after_dependency_done() {
        let mut s = store(vec![task(1, &[]), task(2, &[1]), task(3, &[1])]);
        finish(&mut s, 1, Outcome::Success);
        assert_eq!(
            ids(DependencyResolver::new(&s).ready()),
            vec!["TASK-002", "TASK-003"]
        );
    }

    #[test]
    fn test_in_progress_dependency_does_not_release() {
        let mut s = store(vec![task(1, &[]), task(2, &[1])]);
        s.mark_dispatched(&TaskId::build(1)).unwrap();
        let resolver = DependencyResolver::new(&s);
        assert!(resolver.ready().is_empty());
        assert!(!resolver.is_settled());
    }

    #[test]
    fn test_failed_dependency_blocks_transitively() {
        let mut s = store(vec![task(1, &[]), task(2, &[1]), task(3, &[2]), task(4, &[])]);
        finish(&mut s, 1, Outcome::Failure);

        let resolver = DependencyResolver::new(&s);
        assert_eq!(ids(resolver.ready()), vec!["TASK-004"]);
        assert_eq!(ids(resolver.blocked()), vec!["TASK-002", "TASK-003"]);
    }

    #[test]
    fn test_settled_when_only_blocked_tasks_remain() {
        let mut s = store(vec![task(1, &[]), task(2, &[1])]);
        finish(&mut s, 1, Outcome::Failure);
        assert!(DependencyResolver::new(&s).is_settled());
    }

    #[test]
    fn test_waves_diamond() {
        let s = store(vec![task(1, &[]), task(2, &[1]), task(3, &[1]), task(4, &[2, 3])]);
        let waves = DependencyResolver::new(&s).waves();

        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![TaskId::build(1)]);
        assert_eq!(waves[1], vec![TaskId::build(2), TaskId::build(3)]);
        assert_eq!(waves[2], vec![TaskId::build(4)]);
    }

    #[test]
    fn test_waves_skip_done_and_failed() {
        let mut s = store(vec![task(1, &[]), task(2, &[1]), task(3, &[]), task(4, &[3])]);
        finish(&mut s, 1, Outcome::Success);
        finish(&mut s, 3, Outcome::Failure);

        let waves = DependencyResolver::new(&s).waves();
        assert_eq!(waves, vec![vec![TaskId::build(2)]]);
    }

    #[test]
    fn test_completion_percentage() {
        let mut s = store(vec![task(1, &[]), task(2, &[1])]);
        assert_eq!(DependencyResolver::new(&s).completion_percentage(), 0.0);
        finish(&mut s, 1, Outcome::Success);
        assert_eq!(DependencyResolver::new(&s).completion_percentage(), 50.0);
    }
}
