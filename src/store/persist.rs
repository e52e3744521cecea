//! Durable layout of the orchestrator directory.
//!
//! ```text
//! .orchestrator/
//! ├── foreman.toml
//! ├── issues.json              # global issue store
//! ├── logs/
//! └── loops/
//!     └── loop-001/
//!         ├── tasks.json       # task store for this loop
//!         ├── task_queue.md    # optional human-readable rendering
//!         ├── complete/        # completion markers
//!         └── reports/         # failure reports
//! ```
//!
//! Every JSON write goes through a temp file and a rename so a crash never
//! leaves a half-written store behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::errors::StoreError;
use crate::store::{IssueStore, TaskStore};

const ISSUES_FILE: &str = "issues.json";
const TASKS_FILE: &str = "tasks.json";
const LOOPS_DIR: &str = "loops";

/// Directory name for a loop number.
pub fn loop_dir_name(loop_number: u32) -> String {
    format!("loop-{:03}", loop_number)
}

/// File-backed store rooted at the orchestrator directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let loops = root.join(LOOPS_DIR);
        fs::create_dir_all(&loops).map_err(|source| StoreError::Write {
            path: loops.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent of every `loop-NNN` directory; the completion gate's root.
    pub fn loops_root(&self) -> PathBuf {
        self.root.join(LOOPS_DIR)
    }

    pub fn loop_dir(&self, loop_number: u32) -> PathBuf {
        self.loops_root().join(loop_dir_name(loop_number))
    }

    pub fn reports_dir(&self, loop_number: u32) -> PathBuf {
        self.loop_dir(loop_number).join("reports")
    }

    pub fn queue_file(&self, loop_number: u32) -> PathBuf {
        self.loop_dir(loop_number).join("task_queue.md")
    }

    /// Load a loop's task store; a loop that was never written is empty.
    pub fn load_tasks(&self, loop_number: u32) -> Result<TaskStore, StoreError> {
        let path = self.loop_dir(loop_number).join(TASKS_FILE);
        Ok(read_json(&path)?.unwrap_or_else(|| TaskStore::new(loop_number)))
    }

    pub fn save_tasks(&self, tasks: &TaskStore) -> Result<(), StoreError> {
        let path = self.loop_dir(tasks.loop_number).join(TASKS_FILE);
        write_json(&path, tasks)
    }

    pub fn load_issues(&self) -> Result<IssueStore, StoreError> {
        Ok(read_json(&self.root.join(ISSUES_FILE))?.unwrap_or_default())
    }

    pub fn save_issues(&self, issues: &IssueStore) -> Result<(), StoreError> {
        write_json(&self.root.join(ISSUES_FILE), issues)
    }

    /// Persist a freshly planned batch and the issues it consumed.
    ///
    /// Tasks land first: an issue is only marked in progress on disk once
    /// the remediation task that carries it exists.
    pub fn save_plan(&self, tasks: &TaskStore, issues: &IssueStore) -> Result<(), StoreError> {
        self.save_tasks(tasks)?;
        self.save_issues(issues)
    }

    /// Loop numbers that have a task store on disk, ascending.
    pub fn loops(&self) -> Result<Vec<u32>, StoreError> {
        let dir = self.loops_root();
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Read {
            path: dir.clone(),
            source,
        })?;

        let mut numbers: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(TASKS_FILE).exists())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("loop-"))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    pub fn latest_loop(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.loops()?.last().copied())
    }
}

/// Read a JSON document; `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write a JSON document atomically (temp file + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let write_err = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    debug!(path = %path.display(), "Store file written");
    Ok(())
}
