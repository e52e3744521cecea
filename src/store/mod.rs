//! Durable task and issue records: the only state shared between the
//! controller and its workers.
//!
//! - **task** - task ids, statuses, the retry ledger and the per-loop task store
//! - **issue** - remediation issues and the global issue store
//! - **persist** - the on-disk layout and atomic JSON writes
//! - **queue** - markdown rendering and import of a loop's task queue

mod issue;
mod persist;
mod queue;
mod task;

pub use issue::{Issue, IssueDraft, IssueId, IssueStatus, IssueStore, Priority};
pub use persist::{Store, loop_dir_name, read_json, write_json};
pub use queue::{parse_queue, render_queue};
pub use task::{
    Complexity, DEFAULT_MAX_RETRIES, IntegrationLevel, MockPolicy, RetryLedger, Task, TaskId,
    TaskIdKind, TaskKind, TaskStatus, TaskStore, VERIFICATION_TASK_ID,
};
