//! `foreman init`: create the `.orchestrator/` directory for a project.
//!
//! ```text
//! .orchestrator/
//! ├── foreman.toml     # configuration (written with defaults)
//! ├── issues.json      # created on first write
//! ├── logs/
//! └── loops/
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, ForemanToml};

/// The name of the orchestrator state directory.
pub const ORCHESTRATOR_DIR: &str = ".orchestrator";

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    pub orchestrator_dir: PathBuf,
    /// False if the directory already existed.
    pub created: bool,
}

/// Initialize (or repair) the orchestrator directory.
///
/// `requirements` and `test_plan` are recorded in a newly written
/// `foreman.toml`; an existing configuration is left untouched.
pub fn init_project(
    project_dir: &Path,
    requirements: Option<&Path>,
    test_plan: Option<&Path>,
) -> Result<InitResult> {
    let orchestrator_dir = project_dir.join(ORCHESTRATOR_DIR);
    let created = !orchestrator_dir.exists();

    for dir in [
        orchestrator_dir.clone(),
        orchestrator_dir.join("logs"),
        orchestrator_dir.join("loops"),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_path = orchestrator_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let mut config = ForemanToml::default();
        config.sources.requirements = requirements.map(Path::to_path_buf);
        config.sources.test_plan = test_plan.map(Path::to_path_buf);
        config.save(&config_path)?;
    }

    Ok(InitResult {
        orchestrator_dir,
        created,
    })
}

/// Check if a project has an orchestrator directory.
pub fn is_initialized(project_dir: &Path) -> bool {
    get_orchestrator_dir(project_dir).is_dir()
}

pub fn get_orchestrator_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(ORCHESTRATOR_DIR)
}
