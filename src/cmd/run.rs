//! Dispatch a planned loop: `foreman run`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use foreman::dispatch::{CommandExecutor, DispatchEvent, Dispatcher, RunSummary};
use foreman::gate::Outcome;

use super::{load_project, resolve_loop};

pub async fn cmd_run(
    project_dir: &Path,
    loop_number: Option<u32>,
    worker_cmd: Option<String>,
    max_parallel: Option<usize>,
    verbose: bool,
) -> Result<()> {
    let (config, store) = load_project(project_dir)?;
    for warning in config.validate() {
        println!("{} {}", style("warning:").yellow(), warning);
    }

    let loop_number = resolve_loop(&store, loop_number)?;
    let worker_cmd = worker_cmd
        .or_else(|| config.worker_cmd().map(str::to_string))
        .context("No worker command. Set [dispatch] worker_cmd, FOREMAN_WORKER_CMD or --worker-cmd.")?;

    let mut dispatch_config = config.dispatch_config();
    if let Some(n) = max_parallel {
        dispatch_config.max_parallel = n;
    }
    let slots = dispatch_config.max_parallel;

    let executor = Arc::new(CommandExecutor::new(
        &worker_cmd,
        &config.project_dir,
        &config.orchestrator_dir,
    ));
    let (tx, mut rx) = mpsc::channel::<DispatchEvent>(64);
    let dispatcher = Dispatcher::new(store, executor, dispatch_config, config.retry_policy())
        .with_event_channel(tx);

    println!(
        "{} loop {} with {} slot(s)",
        style("Running").cyan().bold(),
        loop_number,
        slots
    );

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event, verbose);
        }
    });

    let result = dispatcher.run_loop(loop_number).await;
    drop(dispatcher);
    let _ = printer.await;

    let summary = result?;
    print_summary(&summary);
    if !summary.all_success() {
        anyhow::bail!(
            "Loop {} settled with {} failed and {} blocked task(s)",
            loop_number,
            summary.failed,
            summary.blocked.len()
        );
    }
    Ok(())
}

fn print_event(event: &DispatchEvent, verbose: bool) {
    match event {
        DispatchEvent::LoopStarted { tasks, .. } => {
            if verbose {
                println!("  {} tasks in loop", tasks);
            }
        }
        DispatchEvent::Recovered { task, outcome } => match outcome {
            Some(o) => println!("  {} {} (marker: {})", style("↺").yellow(), task, o),
            None => println!("  {} {} (no marker, re-dispatching)", style("↺").yellow(), task),
        },
        DispatchEvent::Started { task, dispatch } => {
            println!("  {} {} (dispatch {})", style("→").dim(), task, dispatch);
        }
        DispatchEvent::Completed {
            task,
            outcome,
            timed_out,
            ..
        } => match (outcome, timed_out) {
            (Outcome::Success, _) => println!("  {} {}", style("✓").green(), task),
            (Outcome::Failure, true) => println!("  {} {} timed out", style("✗").red(), task),
            (Outcome::Failure, false) => println!("  {} {}", style("✗").red(), task),
        },
        DispatchEvent::Retrying { task, retry } => {
            println!("  {} {} retry {}", style("↻").yellow(), task, retry);
        }
        DispatchEvent::Escalated { task, issue } => {
            println!(
                "  {} {} escalated as {}",
                style("!").red().bold(),
                task,
                issue
            );
        }
        DispatchEvent::Exhausted { task, issue } => {
            println!("  {} {} exhausted, raised {}", style("!").yellow(), task, issue);
        }
        DispatchEvent::Halted { task, issue } => {
            println!(
                "  {} {} halted {}: manual intervention required",
                style("■").red().bold(),
                task,
                issue
            );
        }
        DispatchEvent::Settled { .. } => {}
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", style(format!("Loop {} settled", summary.loop_number)).bold());
    println!("  Done:       {}/{}", summary.done, summary.total);
    println!("  Failed:     {}", summary.failed);
    println!("  Blocked:    {}", summary.blocked.len());
    println!("  Dispatches: {}", summary.dispatches);
    println!("  Retries:    {}", summary.retries);
    println!("  Timeouts:   {}", summary.timeouts);
    if summary.recovered > 0 {
        println!("  Recovered:  {}", summary.recovered);
    }
    if !summary.issues_raised.is_empty() {
        let ids: Vec<String> = summary.issues_raised.iter().map(|i| i.to_string()).collect();
        println!("  Issues:     {}", ids.join(", "));
    }
    if !summary.halted.is_empty() {
        let ids: Vec<String> = summary.halted.iter().map(|i| i.to_string()).collect();
        println!("  {}     {}", style("Halted:").red(), ids.join(", "));
    }
    println!("  Duration:   {:.1}s", summary.duration.as_secs_f64());
}
