//! Dependency graph of tasks.
//!
//! Two components:
//!
//! 1. **Builder** - validates a task set as a DAG (unique ids, no dangling
//!    references, no cycles). Runs whenever tasks are created.
//! 2. **Resolver** - computes the ready set, blocked tasks and execution
//!    waves from a store snapshot.
//!
//! ## Example
//!
//! ```no_run
//! use foreman::dag::DependencyResolver;
//! use foreman::store::{Task, TaskId, TaskKind, TaskStore};
//!
//! # fn example() -> Result<(), foreman::errors::StoreError> {
//! let mut store = TaskStore::new(1);
//! store.insert_batch(vec![
//!     Task::new(TaskId::test_batch(1), TaskKind::Test, "Tests", "core"),
//!     Task::new(TaskId::build(1), TaskKind::Build, "Build", "core")
//!         .with_dependencies([TaskId::test_batch(1)]),
//! ])?;
//!
//! let ready = DependencyResolver::new(&store).ready();
//! // Only TASK-T01 is ready; TASK-001 waits for it.
//! # Ok(())
//! # }
//! ```

mod builder;
mod resolver;

pub use builder::{NodeIndex, TaskGraph};
pub use resolver::DependencyResolver;
