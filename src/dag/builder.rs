//! Task graph construction and validation.
//!
//! The builder takes tasks with their dependency sets and constructs a
//! directed acyclic graph. Validation happens here, at creation time, so
//! the resolver can assume a DAG.

use std::collections::HashMap;

use crate::errors::StoreError;
use crate::store::{Task, TaskId};

/// Index into the node list.
pub type NodeIndex = usize;

/// A validated directed acyclic graph of task ids.
#[derive(Debug)]
pub struct TaskGraph {
    /// Task ids indexed by position
    nodes: Vec<TaskId>,
    /// Map from task id to index
    index_map: HashMap<TaskId, NodeIndex>,
    /// Forward edges: index -> tasks that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// Reverse edges: index -> tasks it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl TaskGraph {
    /// Build and validate a graph from tasks.
    ///
    /// - Task ids must be unique
    /// - All dependencies must reference tasks in the set
    /// - No cycles are allowed
    pub fn build<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Result<Self, StoreError> {
        let tasks: Vec<&Task> = tasks.into_iter().collect();

        let mut index_map = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index_map.insert(task.id.clone(), i).is_some() {
                return Err(StoreError::DuplicateTask(task.id.to_string()));
            }
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); tasks.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); tasks.len()];

        for (to_idx, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| StoreError::UnknownDependency {
                            task: task.id.to_string(),
                            dependency: dep.to_string(),
                        })?;

                // from must complete before to
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            nodes: tasks.iter().map(|t| t.id.clone()).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        graph.validate_no_cycles()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn index_of(&self, id: &TaskId) -> Option<NodeIndex> {
        self.index_map.get(id).copied()
    }

    pub fn id_at(&self, index: NodeIndex) -> Option<&TaskId> {
        self.nodes.get(index)
    }

    /// Tasks that depend on the given task.
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks the given task depends on.
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Tasks nothing depends on.
    pub fn sinks(&self) -> Vec<NodeIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Every task reachable from `index` along forward edges.
    pub fn transitive_dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeIndex> = self.dependents(index).to_vec();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if std::mem::replace(&mut seen[next], true) {
                continue;
            }
            out.push(next);
            stack.extend_from_slice(self.dependents(next));
        }
        out.sort_unstable();
        out
    }

    /// Kahn's algorithm; reports every task left on a cycle.
    fn validate_no_cycles(&self) -> Result<(), StoreError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| self.id_at(i).map(|id| id.to_string()))
                .collect();
            return Err(StoreError::Cycle(involved));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskKind;

    fn task(n: u32, deps: &[u32]) -> Task {
        Task::new(TaskId::build(n), TaskKind::Build, &format!("Task {}", n), "core")
            .with_dependencies(deps.iter().map(|d| TaskId::build(*d)))
    }

    #[test]
    fn test_build_simple_graph() {
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1]), task(4, &[2, 3])];
        let graph = TaskGraph::build(&tasks).unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.sinks(), vec![3]);
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1])];
        let graph = TaskGraph::build(&tasks).unwrap();

        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependencies(1), &[0]);
        let dependents = graph.dependents(0);
        assert!(dependents.contains(&1));
        assert!(dependents.contains(&2));
    }

    #[test]
    fn test_cycle_detection_names_involved_tasks() {
        let tasks = vec![task(1, &[3]), task(2, &[1]), task(3, &[2]), task(4, &[])];
        match TaskGraph::build(&tasks) {
            Err(StoreError::Cycle(involved)) => {
                assert_eq!(involved.len(), 3);
                assert!(!involved.contains(&"TASK-004".to_string()));
            }
            other => panic!("Expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let tasks = vec![task(1, &[1])];
        assert!(matches!(
            TaskGraph::build(&tasks),
            Err(StoreError::Cycle(_))
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let tasks = vec![task(1, &[42])];
        let err = TaskGraph::build(&tasks).unwrap_err();
        assert!(err.to_string().contains("TASK-042"));
    }

    #[test]
    fn test_duplicate_task_id() {
        let tasks = vec![task(1, &[]), task(1, &[])];
        assert!(matches!(
            TaskGraph::build(&tasks),
            Err(StoreError::DuplicateTask(_))
        ));
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::build(&Vec::<Task>::new()).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[2]), task(4, &[])];
        let graph = TaskGraph::build(&tasks).unwrap();
        assert_eq!(graph.transitive_dependents(0), vec![1, 2]);
        assert!(graph.transitive_dependents(3).is_empty());
    }
}
