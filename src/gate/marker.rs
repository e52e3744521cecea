//! Completion marker keys and file naming.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::{TaskId, loop_dir_name};

/// Directory under each loop holding its markers.
pub const COMPLETE_DIR: &str = "complete";

/// Marker files carry a constant; only their existence is read.
pub const MARKER_CONTENT: &str = "complete\n";

/// Extension of the file that reserves a key for a single publisher.
pub const CLAIM_EXTENSION: &str = "claim";

/// Marker directory of one loop.
pub fn complete_dir(loops_root: &Path, loop_number: u32) -> PathBuf {
    loops_root.join(loop_dir_name(loop_number)).join(COMPLETE_DIR)
}

/// Terminal outcome a worker publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Success => "done",
            Self::Failure => "failed",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "done" => Some(Self::Success),
            "failed" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" | "done" | "pass" => Ok(Self::Success),
            "failure" | "failed" | "fail" => Ok(Self::Failure),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// How a publish attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    /// This caller wrote the marker.
    Published(Outcome),
    /// A marker was already present; it is the outcome.
    Resolved(Outcome),
    /// Another publisher holds the claim and has not written its marker yet.
    Claimed,
}

impl Publication {
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Published(o) | Self::Resolved(o) => Some(*o),
            Self::Claimed => None,
        }
    }
}

/// What `await_outcome` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Success,
    Failure,
    /// No marker appeared within the wait budget.
    Timeout,
}

impl From<Outcome> for GateOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Self::Success,
            Outcome::Failure => Self::Failure,
        }
    }
}

impl fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Identity of one marker: a task, its loop, and which dispatch of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarkerKey {
    pub task_id: TaskId,
    pub loop_number: u32,
    /// 1-based dispatch ordinal; every orchestrator re-dispatch bumps it.
    pub dispatch: u32,
}

impl MarkerKey {
    pub fn new(task_id: TaskId, loop_number: u32, dispatch: u32) -> Self {
        Self {
            task_id,
            loop_number,
            dispatch,
        }
    }

    /// `TASK-001.2`
    pub fn file_stem(&self) -> String {
        format!("{}.{}", self.task_id, self.dispatch)
    }

    /// Directory holding this key's markers.
    pub fn dir(&self, loops_root: &Path) -> PathBuf {
        complete_dir(loops_root, self.loop_number)
    }

    /// Path of the marker for a given outcome.
    pub fn path(&self, loops_root: &Path, outcome: Outcome) -> PathBuf {
        self.dir(loops_root)
            .join(format!("{}.{}", self.file_stem(), outcome.extension()))
    }

    /// Path of the claim file, shared by both outcomes.
    pub fn claim_path(&self, loops_root: &Path) -> PathBuf {
        self.dir(loops_root)
            .join(format!("{}.{}", self.file_stem(), CLAIM_EXTENSION))
    }

    /// Parse a marker file name back into its key and outcome.
    pub fn from_file_name(loop_number: u32, name: &str) -> Option<(Self, Outcome)> {
        let (stem, ext) = name.rsplit_once('.')?;
        let outcome = Outcome::from_extension(ext)?;
        let (task, dispatch) = stem.rsplit_once('.')?;
        let task_id = TaskId::parse(task).ok()?;
        let dispatch = dispatch.parse().ok()?;
        Some((Self::new(task_id, loop_number, dispatch), outcome))
    }
}

impl fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (loop {}, dispatch {})",
            self.task_id, self.loop_number, self.dispatch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_paths() {
        let key = MarkerKey::new(TaskId::build(3), 2, 1);
        let root = Path::new("/tmp/loops");
        assert_eq!(
            key.path(root, Outcome::Success),
            PathBuf::from("/tmp/loops/loop-002/complete/TASK-003.1.done")
        );
        assert_eq!(
            key.path(root, Outcome::Failure),
            PathBuf::from("/tmp/loops/loop-002/complete/TASK-003.1.failed")
        );
    }

    #[test]
    fn test_from_file_name() {
        let (key, outcome) = MarkerKey::from_file_name(4, "TASK-T02.3.failed").unwrap();
        assert_eq!(key, MarkerKey::new(TaskId::test_batch(2), 4, 3));
        assert_eq!(outcome, Outcome::Failure);

        assert!(MarkerKey::from_file_name(1, "TASK-001.done").is_none());
        assert!(MarkerKey::from_file_name(1, "TASK-001.1.claim").is_none());
        assert!(MarkerKey::from_file_name(1, "TASK-001.1.tmp").is_none());
        assert!(MarkerKey::from_file_name(1, "notes.txt").is_none());
    }

    #[test]
    fn test_outcome_from_str() {
        assert_eq!("done".parse::<Outcome>().unwrap(), Outcome::Success);
        assert_eq!("FAILED".parse::<Outcome>().unwrap(), Outcome::Failure);
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn test_key_display() {
        let key = MarkerKey::new(TaskId::build(1), 1, 2);
        assert_eq!(key.to_string(), "TASK-001 (loop 1, dispatch 2)");
    }
}
