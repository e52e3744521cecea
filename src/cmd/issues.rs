//! Issue backlog commands: `foreman issues`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use foreman::store::{Issue, IssueId, IssueStatus, Priority};

use super::super::IssuesCommands;
use super::load_project;

pub fn cmd_issues(project_dir: &Path, command: Option<IssuesCommands>) -> Result<()> {
    let (_, store) = load_project(project_dir)?;
    let mut issues = store.load_issues()?;

    match command {
        None | Some(IssuesCommands::List { all: false }) => {
            print_list(issues.issues().filter(|i| {
                !matches!(i.status, IssueStatus::Completed | IssueStatus::Superseded)
            }));
        }
        Some(IssuesCommands::List { all: true }) => print_list(issues.issues()),
        Some(IssuesCommands::Show { id }) => {
            let id = IssueId::parse(&id)?;
            let issue = issues
                .get(&id)
                .with_context(|| format!("Issue {} not found", id))?;
            print_issue(issue);
        }
        Some(IssuesCommands::Accept { id }) => {
            let id = IssueId::parse(&id)?;
            issues.accept(&id)?;
            store.save_issues(&issues)?;
            println!("{} {}", style("Accepted").green(), id);
        }
        Some(IssuesCommands::Reopen { id }) => {
            let id = IssueId::parse(&id)?;
            issues.reopen(&id)?;
            store.save_issues(&issues)?;
            println!(
                "{} {}: it will be picked up by the next `foreman plan`",
                style("Reopened").green(),
                id
            );
        }
    }
    Ok(())
}

fn print_list<'a>(issues: impl Iterator<Item = &'a Issue>) {
    let mut any = false;
    for issue in issues {
        any = true;
        println!(
            "{}  {:<8} {:<11} {:>5}  {}",
            issue.id,
            styled_priority(issue.priority),
            issue.status.to_string(),
            format!("{}/{}", issue.ledger.retry_count, issue.ledger.max_retries),
            issue.title
        );
    }
    if !any {
        println!("No issues.");
    }
}

fn print_issue(issue: &Issue) {
    println!("{}", style(format!("{}: {}", issue.id, issue.title)).bold());
    println!("  Status:     {}", issue.status);
    println!("  Priority:   {}", issue.priority);
    println!("  Blocking:   {}", issue.blocking);
    println!("  Root cause: {}", issue.root_cause);
    if let Some(task) = &issue.source_task {
        println!("  Raised by:  {} in loop {}", task, issue.origin_loop);
    }
    println!(
        "  Retries:    {}/{}",
        issue.ledger.retry_count, issue.ledger.max_retries
    );
    if let Some(signature) = &issue.ledger.failure_signature {
        println!(
            "  Signature:  {} (repeated {}x)",
            signature, issue.ledger.signature_repeat_count
        );
    }
    if !issue.ledger.previous_signatures.is_empty() {
        let history: Vec<String> = issue
            .ledger
            .previous_signatures
            .iter()
            .map(|s| s.to_string())
            .collect();
        println!("  History:    {}", history.join(" → "));
    }
    if let Some(successor) = &issue.superseded_by {
        println!("  Superseded: by {}", successor);
    }
    if let Some(reason) = &issue.halt_reason {
        println!("  {}     {}", style("Halted:").red().bold(), reason);
    }
}

fn styled_priority(priority: Priority) -> String {
    let label = format!("{:<8}", priority.to_string());
    match priority {
        Priority::Critical => style(label).red().bold().to_string(),
        Priority::High => style(label).yellow().to_string(),
        Priority::Medium | Priority::Low => label,
    }
}
