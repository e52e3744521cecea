//! Decomposition of a source document into a task batch.
//!
//! - **source** - requirements (TOML) and external test plans (markdown)
//! - **engine** - per-mode batch construction
//! - **invariants** - DAG, TDD ordering and exact test coverage checks
//! - **config** - chunk size, default complexity and retry budget
//!
//! ## Example
//!
//! ```no_run
//! use foreman::decomposition::{DecompositionConfig, DecompositionEngine, TestPlan};
//!
//! # fn example() -> anyhow::Result<()> {
//! let plan = TestPlan::load(std::path::Path::new("docs/test-plan.md"))?;
//! let engine = DecompositionEngine::new(DecompositionConfig::default());
//! let batch = engine.from_test_plan(&plan, 1)?;
//! assert_eq!(batch.covered_test_ids(), plan.all_ids());
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod invariants;
mod source;

pub use config::{
    DEFAULT_MAX_TESTS_PER_TASK, DecompositionConfig, MAX_BUILD_TASKS, MAX_TEST_TASKS,
};
pub use engine::{Batch, DecompositionEngine, EXHAUSTED_HALT_REASON, REMEDIATION_CATEGORY};
pub use invariants::{check_coverage, check_tdd, validate_dag};
pub use source::{DEFAULT_CATEGORY, Feature, Requirements, TestCategory, TestPlan, slugify};
