//! Project initialization and configuration commands.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_init(
    project_dir: &Path,
    requirements: Option<&Path>,
    test_plan: Option<&Path>,
) -> Result<()> {
    use foreman::init::init_project;

    let result = init_project(project_dir, requirements, test_plan)?;

    if result.created {
        println!(
            "Initialized foreman project at {}",
            result.orchestrator_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .orchestrator/");
        println!("  ├── foreman.toml  # Configuration (see `foreman config show`)");
        println!("  ├── logs/         # Controller logs");
        println!("  └── loops/        # Per-loop tasks, markers and failure reports");
        println!();
        println!("Next steps:");
        println!("  1. Set [sources] and [dispatch] worker_cmd in foreman.toml");
        println!("  2. Run `foreman plan` to decompose the first loop");
        println!("  3. Run `foreman run` to dispatch it");
    } else {
        println!(
            "Foreman project already initialized at {}",
            result.orchestrator_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use foreman::config::ForemanConfig;

    let config = ForemanConfig::new(project_dir)?;
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foreman.toml found; using defaults.");
            }
            println!("Effective values (with env overrides):");
            println!();

            let toml = &config.toml;
            println!("[dispatch]");
            println!("  max_parallel = {}", toml.dispatch.max_parallel);
            println!("  gate_timeout_secs = {}", toml.dispatch.gate_timeout_secs);
            println!("  poll_interval_ms = {}", toml.dispatch.poll_interval_ms);
            match &toml.dispatch.worker_cmd {
                Some(cmd) => println!("  worker_cmd = \"{}\"", cmd),
                None => println!("  worker_cmd = (unset)"),
            }
            println!();
            println!("[retry]");
            println!("  max_retries = {}", toml.retry.max_retries);
            println!(
                "  signature_repeat_threshold = {}",
                toml.retry.signature_repeat_threshold
            );
            println!("  local_test_attempts = {}", toml.retry.local_test_attempts);
            println!();
            println!("[decomposition]");
            println!(
                "  max_tests_per_task = {}",
                toml.decomposition.max_tests_per_task
            );
            println!(
                "  default_complexity = \"{}\"",
                toml.decomposition.default_complexity
            );
            println!();
            println!("[sources]");
            for (name, path) in [
                ("requirements", config.requirements_path()),
                ("test_plan", config.test_plan_path()),
            ] {
                match path {
                    Some(p) => println!("  {} = \"{}\"", name, p.display()),
                    None => println!("  {} = (unset)", name),
                }
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
