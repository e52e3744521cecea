//! Events and summaries produced by the dispatcher.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dag::DependencyResolver;
use crate::gate::Outcome;
use crate::store::{IssueId, TaskId, TaskStatus, TaskStore};

/// Progress events emitted while a loop runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    LoopStarted {
        loop_number: u32,
        tasks: usize,
    },
    /// An in-progress task found at startup.
    Recovered {
        task: TaskId,
        /// Marker found for its last dispatch, if any.
        outcome: Option<Outcome>,
    },
    Started {
        task: TaskId,
        dispatch: u32,
    },
    Completed {
        task: TaskId,
        dispatch: u32,
        outcome: Outcome,
        timed_out: bool,
    },
    Retrying {
        task: TaskId,
        retry: u32,
    },
    Escalated {
        task: TaskId,
        issue: IssueId,
    },
    Exhausted {
        task: TaskId,
        issue: IssueId,
    },
    Halted {
        task: TaskId,
        issue: IssueId,
    },
    /// Nothing is ready and nothing is running.
    Settled {
        summary: RunSummary,
    },
}

/// Outcome of one `run_loop` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub loop_number: u32,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    /// Still pending because a dependency failed.
    pub blocked: Vec<TaskId>,
    pub dispatches: u32,
    pub retries: u32,
    pub timeouts: u32,
    pub recovered: u32,
    pub issues_raised: Vec<IssueId>,
    pub halted: Vec<IssueId>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn new(loop_number: u32) -> Self {
        Self {
            loop_number,
            ..Default::default()
        }
    }

    /// Fill the per-status counts from the final store state.
    pub fn finalize(&mut self, tasks: &TaskStore, duration: Duration) {
        self.total = tasks.len();
        self.done = tasks.count_by_status(TaskStatus::Done);
        self.failed = tasks.count_by_status(TaskStatus::Failed);
        self.blocked = DependencyResolver::new(tasks)
            .blocked()
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        self.duration = duration;
    }

    pub fn all_success(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
