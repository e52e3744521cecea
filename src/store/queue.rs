//! Markdown task queue rendering and import.
//!
//! The queue uses a hybrid layout: one `###` header per task, a metadata
//! table, a `---` separator, then prose fields in bold-label form.
//!
//! ```text
//! ### TASK-T01: Tests for auth
//!
//! | Field | Value |
//! |-------|-------|
//! | Status | pending |
//! | Kind | test |
//! | Category | auth |
//! | Depends On | - |
//! | Test IDs | AUTH-001, AUTH-002 |
//!
//! ---
//!
//! **Description:** Write failing tests for login.
//! ```

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::StoreError;
use crate::store::{
    Complexity, IntegrationLevel, IssueId, MockPolicy, Task, TaskId, TaskKind, TaskStatus,
};

static HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{3,4}\s+(TASK-[A-Z0-9]+):\s*(.*)$").expect("valid regex"));
static TABLE_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\|\s*([^|]+?)\s*\|\s*(.*?)\s*\|\s*$").expect("valid regex"));
static BOLD_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*(\w+(?:\s+\w+)?):\*\*\s*(.*)$").expect("valid regex"));

/// Render a loop's tasks as a markdown queue.
pub fn render_queue<'a>(loop_number: u32, tasks: impl IntoIterator<Item = &'a Task>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task Queue: Loop {}", loop_number);

    for task in tasks {
        let _ = writeln!(out);
        let _ = writeln!(out, "### {}: {}", task.id, task.title);
        let _ = writeln!(out);
        let _ = writeln!(out, "| Field | Value |");
        let _ = writeln!(out, "|-------|-------|");
        let _ = writeln!(out, "| Status | {} |", task.status);
        let _ = writeln!(out, "| Kind | {} |", kind_str(task.kind));
        let _ = writeln!(out, "| Category | {} |", task.category);
        let _ = writeln!(out, "| Complexity | {} |", task.complexity);
        let _ = writeln!(out, "| Depends On | {} |", join_or_dash(&task.dependencies));
        if task.kind == TaskKind::Test {
            let _ = writeln!(out, "| Test IDs | {} |", join_or_dash(&task.test_ids));
            if let Some(level) = task.integration_level {
                let _ = writeln!(out, "| Integration Level | {} |", enum_str(&level));
            }
            if let Some(policy) = task.mock_policy {
                let _ = writeln!(out, "| Mock Policy | {} |", enum_str(&policy));
            }
        }
        if let Some(issue) = &task.source_issue {
            let _ = writeln!(out, "| Source Issue | {} |", issue);
            let _ = writeln!(
                out,
                "| Retries | {}/{} |",
                task.ledger.retry_count, task.ledger.max_retries
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "---");
        let _ = writeln!(out);
        if !task.description.is_empty() {
            let _ = writeln!(out, "**Description:** {}", task.description);
        }
    }
    out
}

/// Parse a markdown queue back into tasks.
///
/// Only the structural fields are read; retry history is not part of the
/// queue format. Malformed ids or enum values are rejected.
pub fn parse_queue(content: &str) -> Result<Vec<Task>, StoreError> {
    let mut tasks = Vec::new();
    let mut current: Option<Task> = None;
    let mut in_description = false;

    for line in content.lines() {
        if let Some(caps) = HEADER.captures(line) {
            if let Some(task) = current.take() {
                tasks.push(task);
            }
            let id = TaskId::parse(&caps[1])?;
            let kind = default_kind(&id);
            current = Some(Task::new(id, kind, caps[2].trim(), "general"));
            in_description = false;
            continue;
        }

        let Some(task) = current.as_mut() else {
            continue;
        };

        if let Some(caps) = TABLE_ROW.captures(line) {
            apply_field(task, &caps[1], &caps[2])?;
            continue;
        }

        if let Some(caps) = BOLD_FIELD.captures(line) {
            in_description = &caps[1] == "Description";
            if in_description {
                task.description = caps[2].trim().to_string();
            }
            continue;
        }

        if in_description && !line.trim().is_empty() && line.trim() != "---" {
            if !task.description.is_empty() {
                task.description.push('\n');
            }
            task.description.push_str(line.trim());
        }
    }

    if let Some(task) = current.take() {
        tasks.push(task);
    }
    Ok(tasks)
}

fn apply_field(task: &mut Task, field: &str, value: &str) -> Result<(), StoreError> {
    let id = task.id.to_string();
    let invalid = |what: &'static str| StoreError::InvalidField {
        id: id.clone(),
        field: what,
        value: value.to_string(),
    };
    match field {
        "Status" => task.status = value.parse::<TaskStatus>().map_err(|_| invalid("status"))?,
        "Kind" => task.kind = parse_kind(value).ok_or_else(|| invalid("kind"))?,
        "Category" => task.category = value.to_string(),
        "Complexity" => {
            task.complexity = value
                .parse::<Complexity>()
                .map_err(|_| invalid("complexity"))?
        }
        "Depends On" => {
            task.dependencies = split_list(value)
                .map(TaskId::parse)
                .collect::<Result<BTreeSet<_>, _>>()?
        }
        "Test IDs" => task.test_ids = split_list(value).map(str::to_string).collect(),
        "Integration Level" => {
            task.integration_level = Some(
                parse_enum::<IntegrationLevel>(value).ok_or_else(|| invalid("integration level"))?,
            )
        }
        "Mock Policy" => {
            task.mock_policy =
                Some(parse_enum::<MockPolicy>(value).ok_or_else(|| invalid("mock policy"))?)
        }
        "Source Issue" => task.source_issue = Some(IssueId::parse(value)?),
        _ => {}
    }
    Ok(())
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "-")
}

fn default_kind(id: &TaskId) -> TaskKind {
    match id.kind() {
        crate::store::TaskIdKind::Build => TaskKind::Build,
        crate::store::TaskIdKind::TestBatch => TaskKind::Test,
        crate::store::TaskIdKind::Verification => TaskKind::Verification,
    }
}

fn kind_str(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Test => "test",
        TaskKind::Build => "build",
        TaskKind::Remediation => "remediation",
        TaskKind::Verification => "verification",
    }
}

fn parse_kind(value: &str) -> Option<TaskKind> {
    match value.trim().to_lowercase().as_str() {
        "test" => Some(TaskKind::Test),
        "build" => Some(TaskKind::Build),
        "remediation" => Some(TaskKind::Remediation),
        "verification" => Some(TaskKind::Verification),
        _ => None,
    }
}

fn join_or_dash<T: std::fmt::Display>(items: &BTreeSet<T>) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Serialize a unit enum through serde to get its snake_case name.
fn enum_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_string())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Task> {
        let test = Task::test(
            TaskId::test_batch(1),
            "Tests for auth",
            "auth",
            ["AUTH-001".to_string(), "AUTH-002".to_string()].into(),
        )
        .with_test_profile(IntegrationLevel::Integration, MockPolicy::Forbidden)
        .with_description("Write failing tests for login.");
        let build = Task::new(TaskId::build(1), TaskKind::Build, "Implement login", "auth")
            .with_complexity(Complexity::High)
            .with_dependencies([TaskId::test_batch(1)]);
        vec![test, build]
    }

    #[test]
    fn test_render_contains_metadata_table() {
        let rendered = render_queue(3, &sample());
        assert!(rendered.starts_with("# Task Queue: Loop 3"));
        assert!(rendered.contains("### TASK-T01: Tests for auth"));
        assert!(rendered.contains("| Status | pending |"));
        assert!(rendered.contains("| Test IDs | AUTH-001, AUTH-002 |"));
        assert!(rendered.contains("| Integration Level | integration |"));
        assert!(rendered.contains("| Depends On | TASK-T01 |"));
        assert!(rendered.contains("**Description:** Write failing tests for login."));
    }

    #[test]
    fn test_parse_rendered_queue_preserves_structure() {
        let original = sample();
        let parsed = parse_queue(&render_queue(1, &original)).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, original[0].id);
        assert_eq!(parsed[0].kind, TaskKind::Test);
        assert_eq!(parsed[0].test_ids, original[0].test_ids);
        assert_eq!(parsed[0].mock_policy, Some(MockPolicy::Forbidden));
        assert_eq!(parsed[0].description, "Write failing tests for login.");
        assert_eq!(parsed[1].dependencies, original[1].dependencies);
        assert_eq!(parsed[1].complexity, Complexity::High);
    }

    #[test]
    fn test_parse_hand_written_queue() {
        let content = "\
### TASK-001: Implement parser

| Field | Value |
|-------|-------|
| Status | pending |
| Category | parsing |
| Depends On | TASK-T01, TASK-T02 |

---

**Description:** Parse the input.
Handle errors too.
";
        let tasks = parse_queue(content).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, TaskKind::Build);
        assert_eq!(tasks[0].category, "parsing");
        assert_eq!(tasks[0].dependencies.len(), 2);
        assert_eq!(tasks[0].description, "Parse the input.\nHandle errors too.");
    }

    #[test]
    fn test_parse_rejects_bad_dependency_id() {
        let content = "### TASK-001: x\n\n| Depends On | TASK-1 |\n";
        assert!(matches!(
            parse_queue(content),
            Err(StoreError::InvalidTaskId(_))
        ));
    }
}
