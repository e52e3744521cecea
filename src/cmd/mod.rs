//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                  |
//! |------------|-----------------------------------|
//! | `project`  | `Init`, `Config`                  |
//! | `plan`     | `Plan`                            |
//! | `run`      | `Run`                             |
//! | `status`   | `Status`, `Ready`, `Queue`        |
//! | `publish`  | `Publish`                         |
//! | `issues`   | `Issues`                          |

pub mod issues;
pub mod plan;
pub mod project;
pub mod publish;
pub mod run;
pub mod status;

pub use issues::cmd_issues;
pub use plan::cmd_plan;
pub use project::{cmd_config, cmd_init};
pub use publish::cmd_publish;
pub use run::cmd_run;
pub use status::{cmd_queue, cmd_ready, cmd_status};

use anyhow::{Context, Result};
use std::path::Path;

use foreman::config::ForemanConfig;
use foreman::init::is_initialized;
use foreman::store::Store;

/// Load configuration and open the store of an initialized project.
pub fn load_project(project_dir: &Path) -> Result<(ForemanConfig, Store)> {
    if !is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'foreman init' first.");
    }
    let config = ForemanConfig::new(project_dir)?;
    let store = Store::open(&config.orchestrator_dir)
        .with_context(|| format!("Failed to open store at {}", config.orchestrator_dir.display()))?;
    Ok((config, store))
}

/// An explicit loop number, or the latest planned loop.
pub fn resolve_loop(store: &Store, requested: Option<u32>) -> Result<u32> {
    match requested {
        Some(n) => Ok(n),
        None => store
            .latest_loop()?
            .context("No loop planned yet. Run 'foreman plan' first."),
    }
}
