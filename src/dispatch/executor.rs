//! Worker abstraction.
//!
//! What a worker actually does is opaque to the orchestrator. It sees one
//! attempt at a time through `TaskExecutor`; the harness in `worker.rs`
//! owns local retries and marker publication.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::gate::MarkerKey;
use crate::retry::{Attempt, FailureKind, RootCause};
use crate::store::Task;

/// Everything a worker knows about the attempt it is running.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptContext {
    #[serde(skip)]
    pub key: MarkerKey,
    pub loop_number: u32,
    pub dispatch: u32,
    /// 1-based worker-local attempt number.
    pub attempt: u32,
    /// Earlier local attempts in this dispatch.
    pub previous_attempts: Vec<Attempt>,
}

impl AttemptContext {
    pub fn new(key: MarkerKey, attempt: u32, previous_attempts: Vec<Attempt>) -> Self {
        Self {
            loop_number: key.loop_number,
            dispatch: key.dispatch,
            key,
            attempt,
            previous_attempts,
        }
    }
}

/// How one attempt failed, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub kind: FailureKind,
    pub root_cause: RootCause,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub build_passed: bool,
    #[serde(default)]
    pub output: String,
}

impl AttemptFailure {
    pub fn new(kind: FailureKind, root_cause: RootCause) -> Self {
        Self {
            kind,
            root_cause,
            approach: String::new(),
            build_passed: !kind.is_immediate(),
            output: String::new(),
        }
    }

    pub fn with_approach(mut self, approach: &str) -> Self {
        self.approach = approach.to_string();
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Passed,
    Failed(AttemptFailure),
}

/// One attempt at a task. Test doubles implement this directly.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn attempt(&self, task: &Task, ctx: &AttemptContext) -> Result<AttemptResult>;
}

/// Payload written to a worker command's stdin.
#[derive(Serialize)]
struct WorkerRequest<'a> {
    task: &'a Task,
    #[serde(flatten)]
    context: &'a AttemptContext,
}

/// Runs an external command per attempt.
///
/// The task and attempt context are passed as JSON on stdin and in
/// `FOREMAN_*` environment variables. Exit code 0 means the attempt passed.
/// On failure the worker may print an `AttemptFailure` JSON object as its
/// last stdout line; otherwise a test failure is assumed.
pub struct CommandExecutor {
    command: String,
    project_dir: PathBuf,
    orchestrator_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: &str, project_dir: &Path, orchestrator_dir: &Path) -> Self {
        Self {
            command: command.to_string(),
            project_dir: project_dir.to_path_buf(),
            orchestrator_dir: orchestrator_dir.to_path_buf(),
        }
    }

    fn parse_failure(&self, task: &Task, output: &std::process::Output) -> AttemptFailure {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let reported = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(|line| serde_json::from_str::<AttemptFailure>(line).ok());
        if let Some(failure) = reported {
            return failure;
        }

        let code = output.status.code().unwrap_or(-1);
        let last_error = stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no output");
        AttemptFailure::new(
            FailureKind::TestFailure,
            RootCause::new(
                "worker_exit",
                &format!("exit code {}: {}", code, last_error),
                task.id.as_str(),
                "",
            ),
        )
        .with_output(&stderr)
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn attempt(&self, task: &Task, ctx: &AttemptContext) -> Result<AttemptResult> {
        let request = serde_json::to_string(&WorkerRequest { task, context: ctx })
            .context("Failed to serialize worker request")?;

        debug!(task = %task.id, attempt = ctx.attempt, command = %self.command, "Spawning worker");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FOREMAN_TASK_ID", task.id.as_str())
            .env("FOREMAN_LOOP", ctx.loop_number.to_string())
            .env("FOREMAN_DISPATCH", ctx.dispatch.to_string())
            .env("FOREMAN_ATTEMPT", ctx.attempt.to_string())
            .env("FOREMAN_DIR", &self.orchestrator_dir)
            .spawn()
            .with_context(|| format!("Failed to spawn worker command: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that never reads its request may exit first.
            match stdin.write_all(request.as_bytes()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(task = %task.id, "Worker closed stdin before reading the request");
                }
                Err(e) => return Err(e).context("Failed to write worker request to stdin"),
            }
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for worker command")?;

        debug!(
            task = %task.id,
            attempt = ctx.attempt,
            code = output.status.code().unwrap_or(-1),
            "Worker exited"
        );

        if output.status.success() {
            Ok(AttemptResult::Passed)
        } else {
            Ok(AttemptResult::Failed(self.parse_failure(task, &output)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TaskId, TaskKind};
    use tempfile::TempDir;

    fn ctx() -> AttemptContext {
        AttemptContext::new(MarkerKey::new(TaskId::build(1), 1, 1), 1, Vec::new())
    }

    fn task() -> Task {
        Task::new(TaskId::build(1), TaskKind::Build, "Login", "auth")
    }

    #[tokio::test]
    async fn test_command_executor_success() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new("cat > /dev/null; exit 0", dir.path(), dir.path());
        let result = executor.attempt(&task(), &ctx()).await.unwrap();
        assert_eq!(result, AttemptResult::Passed);
    }

    #[tokio::test]
    async fn test_command_executor_reads_reported_failure() {
        let dir = TempDir::new().unwrap();
        let cmd = r#"cat > /dev/null; echo progress; echo '{"kind":"type_failure","root_cause":{"root_cause_type":"type","primary_error":"E0308"}}'; exit 1"#;
        let executor = CommandExecutor::new(cmd, dir.path(), dir.path());

        match executor.attempt(&task(), &ctx()).await.unwrap() {
            AttemptResult::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::TypeFailure);
                assert_eq!(failure.root_cause.primary_error, "E0308");
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_executor_defaults_to_test_failure() {
        let dir = TempDir::new().unwrap();
        let executor =
            CommandExecutor::new("cat > /dev/null; echo 'boom' >&2; exit 3", dir.path(), dir.path());

        match executor.attempt(&task(), &ctx()).await.unwrap() {
            AttemptResult::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::TestFailure);
                assert!(failure.root_cause.primary_error.contains("exit code 3"));
                assert!(failure.root_cause.primary_error.contains("boom"));
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_executor_receives_task_env_and_stdin() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("seen.txt");
        let cmd = format!(
            "cat > {0}.json; echo \"$FOREMAN_TASK_ID $FOREMAN_LOOP $FOREMAN_ATTEMPT\" > {0}",
            out.display()
        );
        let executor = CommandExecutor::new(&cmd, dir.path(), dir.path());
        executor.attempt(&task(), &ctx()).await.unwrap();

        let seen = std::fs::read_to_string(&out).unwrap();
        assert_eq!(seen.trim(), "TASK-001 1 1");
        let request: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(format!("{}.json", out.display())).unwrap())
                .unwrap();
        assert_eq!(request["task"]["id"], "TASK-001");
        assert_eq!(request["attempt"], 1);
    }
}
