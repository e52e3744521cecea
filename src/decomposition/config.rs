//! Configuration for batch construction.

use serde::{Deserialize, Serialize};

use crate::store::{Complexity, DEFAULT_MAX_RETRIES};

/// Default cap on test identifiers per test task.
pub const DEFAULT_MAX_TESTS_PER_TASK: usize = 15;

/// Highest `TASK-TNN` number.
pub const MAX_TEST_TASKS: u32 = 99;

/// Highest `TASK-NNN` number.
pub const MAX_BUILD_TASKS: u32 = 999;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    /// Test identifiers per test task before chunking.
    pub max_tests_per_task: usize,
    /// Complexity for tasks whose source does not say.
    pub default_complexity: Complexity,
    /// Retry budget given to freshly created tasks.
    pub max_retries: u32,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            max_tests_per_task: DEFAULT_MAX_TESTS_PER_TASK,
            default_complexity: Complexity::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl DecompositionConfig {
    /// Set the chunk size; zero is treated as one.
    pub fn set_max_tests_per_task(mut self, max: usize) -> Self {
        self.max_tests_per_task = max.max(1);
        self
    }

    pub fn set_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn set_default_complexity(mut self, complexity: Complexity) -> Self {
        self.default_complexity = complexity;
        self
    }
}
