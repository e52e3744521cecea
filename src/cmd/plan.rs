//! Decompose the next loop: `foreman plan`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use foreman::decomposition::DecompositionEngine;
use foreman::mode::{Mode, ModeController, TriggerContext};
use foreman::store::{TaskKind, TaskStore, render_queue};

use super::load_project;

pub fn cmd_plan(
    project_dir: &Path,
    mode: Option<Mode>,
    requirements: Option<PathBuf>,
    test_plan: Option<PathBuf>,
) -> Result<()> {
    let (config, store) = load_project(project_dir)?;
    let mut issues = store.load_issues()?;
    let prior_loops = store.loops()?;
    let loop_number = prior_loops.last().map_or(1, |n| n + 1);

    // A configured test plan seeds the first loop only; a flag always applies.
    let test_plan = test_plan.or_else(|| {
        if prior_loops.is_empty() {
            config.test_plan_path()
        } else {
            None
        }
    });
    let ctx = TriggerContext::new()
        .with_explicit(mode)
        .with_requirements(requirements.or_else(|| config.requirements_path()))
        .with_test_plan(test_plan)
        .with_critical_backlog(issues.critical_backlog().len())
        .with_prior_loops(prior_loops.len());
    let selection = ModeController::select(&ctx)?;

    let engine = DecompositionEngine::new(config.decomposition_config());
    let batch = match engine.decompose(&selection, loop_number, &mut issues) {
        Ok(batch) => batch,
        Err(e) => {
            // Issues halted for a spent budget stay halted even if nothing was planned.
            store.save_issues(&issues)?;
            return Err(e.into());
        }
    };

    let mut tasks = TaskStore::new(loop_number);
    tasks.insert_batch(batch.tasks.clone())?;
    store.save_plan(&tasks, &issues)?;
    let queue_path = store.queue_file(loop_number);
    std::fs::write(&queue_path, render_queue(loop_number, tasks.tasks()))
        .with_context(|| format!("Failed to write task queue: {}", queue_path.display()))?;

    let count = |kind| batch.tasks.iter().filter(|t| t.kind == kind).count();
    println!(
        "{} loop {} ({}: {})",
        console::style("Planned").green().bold(),
        loop_number,
        selection.mode,
        selection.reason
    );
    println!("  Source:       {}", selection.source);
    println!("  Test tasks:   {}", count(TaskKind::Test));
    println!(
        "  Build tasks:  {}",
        count(TaskKind::Build) + count(TaskKind::Remediation)
    );
    println!("  Test IDs:     {}", batch.covered_test_ids().len());
    if !batch.consumed_issues.is_empty() {
        println!("  Issues taken: {}", join(&batch.consumed_issues));
    }
    if !batch.halted_issues.is_empty() {
        println!(
            "  {} {}",
            console::style("Halted:").yellow(),
            join(&batch.halted_issues)
        );
    }
    println!("  Queue:        {}", queue_path.display());

    Ok(())
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
