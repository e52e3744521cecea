//! Loop inspection commands: `status`, `ready` and `queue`.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};

use foreman::dag::DependencyResolver;
use foreman::decomposition::DecompositionEngine;
use foreman::store::{IssueStatus, TaskStatus, TaskStore, parse_queue, render_queue};

use super::{load_project, resolve_loop};

pub fn cmd_status(project_dir: &Path, loop_number: Option<u32>, json: bool) -> Result<()> {
    let (_, store) = load_project(project_dir)?;
    let loop_number = resolve_loop(&store, loop_number)?;
    let tasks = store.load_tasks(loop_number)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    let resolver = DependencyResolver::new(&tasks);
    println!();
    println!(
        "{}",
        style(format!("Loop {} status", loop_number)).bold().cyan()
    );
    println!();
    println!(
        "  {:<11} {:<12} {:<13} {:>4} {:>7}  Title",
        "Task", "Status", "Kind", "Disp", "Retries"
    );
    for task in tasks.tasks() {
        println!(
            "  {:<11} {:<12} {:<13} {:>4} {:>7}  {}",
            task.id.as_str(),
            styled_status(task.status),
            format!("{:?}", task.kind).to_lowercase(),
            task.dispatch_count,
            format!("{}/{}", task.ledger.retry_count, task.ledger.max_retries),
            task.title
        );
    }
    println!();
    print_counts(&tasks);
    println!(
        "  Completion: {:.0}%",
        resolver.completion_percentage()
    );
    let blocked = resolver.blocked();
    if !blocked.is_empty() {
        let ids: Vec<&str> = blocked.iter().map(|t| t.id.as_str()).collect();
        println!("  {} {}", style("Blocked:").red(), ids.join(", "));
    }

    let issues = store.load_issues()?;
    if !issues.is_empty() {
        let open = issues.issues().filter(|i| i.is_decomposable()).count();
        let halted = issues
            .issues()
            .filter(|i| i.status == IssueStatus::Halted)
            .count();
        println!("  Issues: {} open, {} halted, {} total", open, halted, issues.len());
    }
    println!();
    Ok(())
}

pub fn cmd_ready(project_dir: &Path, loop_number: Option<u32>) -> Result<()> {
    let (_, store) = load_project(project_dir)?;
    let loop_number = resolve_loop(&store, loop_number)?;
    let tasks = store.load_tasks(loop_number)?;
    let ready = DependencyResolver::new(&tasks).ready();

    if ready.is_empty() {
        println!("No tasks ready in loop {}.", loop_number);
        return Ok(());
    }
    for task in ready {
        println!("{}  {}", task.id, task.title);
    }
    Ok(())
}

/// Print the loop's queue, or import an edited queue as a new loop.
pub fn cmd_queue(
    project_dir: &Path,
    loop_number: Option<u32>,
    import: Option<PathBuf>,
) -> Result<()> {
    let (config, store) = load_project(project_dir)?;

    if let Some(path) = import {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read queue: {}", path.display()))?;
        let parsed = parse_queue(&content)?;
        let loop_number = store.latest_loop()?.map_or(1, |n| n + 1);
        let batch = DecompositionEngine::new(config.decomposition_config())
            .from_queue(parsed, loop_number)?;

        let mut tasks = TaskStore::new(loop_number);
        tasks.insert_batch(batch.tasks)?;
        store.save_tasks(&tasks)?;
        std::fs::write(
            store.queue_file(loop_number),
            render_queue(loop_number, tasks.tasks()),
        )?;
        println!(
            "{} {} task(s) as loop {}",
            style("Imported").green().bold(),
            tasks.len(),
            loop_number
        );
        return Ok(());
    }

    let loop_number = resolve_loop(&store, loop_number)?;
    let tasks = store.load_tasks(loop_number)?;
    print!("{}", render_queue(loop_number, tasks.tasks()));
    Ok(())
}

fn print_counts(tasks: &TaskStore) {
    println!(
        "  {} done, {} failed, {} in progress, {} pending",
        tasks.count_by_status(TaskStatus::Done),
        tasks.count_by_status(TaskStatus::Failed),
        tasks.count_by_status(TaskStatus::InProgress),
        tasks.count_by_status(TaskStatus::Pending),
    );
}

fn styled_status(status: TaskStatus) -> String {
    let label = format!("{:<12}", status.to_string());
    match status {
        TaskStatus::Done => style(label).green().to_string(),
        TaskStatus::Failed => style(label).red().to_string(),
        TaskStatus::InProgress => style(label).yellow().to_string(),
        TaskStatus::Pending => style(label).dim().to_string(),
    }
}
