//! Worker side of the completion channel: `foreman publish`.
//!
//! Out-of-process workers call this once at the end of a dispatch. A
//! failure may carry a report file, or a kind and error message from which
//! a minimal report is written.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};

use foreman::dispatch::publish_outcome;
use foreman::gate::{CompletionGate, MarkerKey, Outcome, Publication};
use foreman::retry::{FailureKind, FailureReport, RootCause};
use foreman::store::{TaskId, read_json};

use super::load_project;

pub struct PublishArgs {
    pub task: String,
    pub loop_number: u32,
    pub dispatch: u32,
    pub outcome: Outcome,
    pub report: Option<PathBuf>,
    pub kind: Option<FailureKind>,
    pub error: Option<String>,
}

pub fn cmd_publish(project_dir: &Path, args: PublishArgs) -> Result<()> {
    let (config, store) = load_project(project_dir)?;
    let task_id = TaskId::parse(&args.task)?;
    let key = MarkerKey::new(task_id, args.loop_number, args.dispatch);

    let report = match (args.outcome, &args.report, args.kind) {
        (Outcome::Success, Some(_), _) | (Outcome::Success, _, Some(_)) => {
            anyhow::bail!("--report and --kind only apply to a failure outcome");
        }
        (Outcome::Failure, Some(path), _) => {
            let mut report: FailureReport = read_json(path)?
                .with_context(|| format!("Report file is empty: {}", path.display()))?;
            report.task_id = key.task_id.clone();
            report.loop_number = key.loop_number;
            report.dispatch = key.dispatch;
            Some(report.normalized())
        }
        (Outcome::Failure, None, Some(kind)) => {
            let error = args.error.as_deref().unwrap_or("worker reported failure");
            Some(FailureReport::new(
                &key,
                kind,
                RootCause::new("worker_reported", error, key.task_id.as_str(), ""),
            ))
        }
        _ => None,
    };

    let gate = CompletionGate::new(store.loops_root(), config.dispatch_config().poll_interval);
    match publish_outcome(&gate, &key, args.outcome, report.as_ref())? {
        Publication::Published(outcome) => {
            println!("{} {} as {}", style("Published").green(), key, outcome);
        }
        Publication::Resolved(existing) => {
            println!(
                "{} {} already resolved as {}",
                style("Skipped:").yellow(),
                key,
                existing
            );
        }
        Publication::Claimed => {
            anyhow::bail!("{} is claimed by another publisher; retry shortly", key);
        }
    }
    Ok(())
}
