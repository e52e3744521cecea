//! Layered configuration for Foreman.
//!
//! Settings come from `.orchestrator/foreman.toml`, then `FOREMAN_*`
//! environment variables, then CLI flags. Missing sections fall back to
//! defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [dispatch]
//! max_parallel = 4
//! gate_timeout_secs = 1800
//! poll_interval_ms = 500
//! worker_cmd = "claude-worker"
//!
//! [retry]
//! max_retries = 10
//! signature_repeat_threshold = 3
//! local_test_attempts = 3
//!
//! [decomposition]
//! max_tests_per_task = 15
//! default_complexity = "medium"
//!
//! [sources]
//! requirements = "docs/requirements.toml"
//! test_plan = "docs/test-plan.md"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decomposition::{DEFAULT_MAX_TESTS_PER_TASK, DecompositionConfig};
use crate::dispatch::{DEFAULT_LOCAL_TEST_ATTEMPTS, DispatchConfig};
use crate::init::ORCHESTRATOR_DIR;
use crate::retry::{DEFAULT_REPEAT_THRESHOLD, MAX_LOCAL_ATTEMPTS, RetryPolicy};
use crate::store::{Complexity, DEFAULT_MAX_RETRIES};

/// File name of the configuration inside the orchestrator directory.
pub const CONFIG_FILE: &str = "foreman.toml";

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_gate_timeout_secs")]
    pub gate_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Shell command run once per task attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_cmd: Option<String>,
}

fn default_max_parallel() -> usize {
    4
}

fn default_gate_timeout_secs() -> u64 {
    1800
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            gate_timeout_secs: default_gate_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            worker_cmd: None,
        }
    }
}

/// Retry and loop-breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_signature_repeat_threshold")]
    pub signature_repeat_threshold: u32,
    #[serde(default = "default_local_test_attempts")]
    pub local_test_attempts: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_signature_repeat_threshold() -> u32 {
    DEFAULT_REPEAT_THRESHOLD
}

fn default_local_test_attempts() -> u32 {
    DEFAULT_LOCAL_TEST_ATTEMPTS
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            signature_repeat_threshold: default_signature_repeat_threshold(),
            local_test_attempts: default_local_test_attempts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionSection {
    #[serde(default = "default_max_tests_per_task")]
    pub max_tests_per_task: usize,
    #[serde(default)]
    pub default_complexity: Complexity,
}

fn default_max_tests_per_task() -> usize {
    DEFAULT_MAX_TESTS_PER_TASK
}

impl Default for DecompositionSection {
    fn default() -> Self {
        Self {
            max_tests_per_task: default_max_tests_per_task(),
            default_complexity: Complexity::default(),
        }
    }
}

/// Source documents, relative to the project directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_plan: Option<PathBuf>,
}

/// The complete foreman.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub decomposition: DecompositionSection,
    #[serde(default)]
    pub sources: SourcesSection,
}

impl ForemanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `foreman.toml` from the orchestrator directory, or defaults if
    /// the file doesn't exist.
    pub fn load_or_default(orchestrator_dir: &Path) -> Result<Self> {
        let config_path = orchestrator_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FOREMAN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `FOREMAN_*` overrides from `lookup`. Unparsable values are
    /// skipped and reported as warnings.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        fn set<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            target: &mut T,
            warnings: &mut Vec<String>,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(value) => *target = value,
                    Err(_) => warnings.push(format!("Ignoring {}='{}': not a valid value", key, raw)),
                }
            }
        }

        set(&lookup, "FOREMAN_MAX_PARALLEL", &mut self.dispatch.max_parallel, &mut warnings);
        set(
            &lookup,
            "FOREMAN_GATE_TIMEOUT_SECS",
            &mut self.dispatch.gate_timeout_secs,
            &mut warnings,
        );
        set(
            &lookup,
            "FOREMAN_POLL_INTERVAL_MS",
            &mut self.dispatch.poll_interval_ms,
            &mut warnings,
        );
        set(&lookup, "FOREMAN_MAX_RETRIES", &mut self.retry.max_retries, &mut warnings);
        set(
            &lookup,
            "FOREMAN_SIGNATURE_REPEAT_THRESHOLD",
            &mut self.retry.signature_repeat_threshold,
            &mut warnings,
        );
        set(
            &lookup,
            "FOREMAN_LOCAL_TEST_ATTEMPTS",
            &mut self.retry.local_test_attempts,
            &mut warnings,
        );
        if let Some(cmd) = lookup("FOREMAN_WORKER_CMD").filter(|c| !c.trim().is_empty()) {
            self.dispatch.worker_cmd = Some(cmd);
        }

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.dispatch.max_parallel == 0 {
            warnings.push("dispatch.max_parallel is 0: no task will ever be dispatched".into());
        }
        if self.dispatch.gate_timeout_secs == 0 {
            warnings.push("dispatch.gate_timeout_secs is 0: every task will time out".into());
        }
        if self.dispatch.poll_interval_ms == 0 {
            warnings.push("dispatch.poll_interval_ms is 0: marker polling will spin".into());
        }
        if self.retry.signature_repeat_threshold < 2 {
            warnings.push(format!(
                "retry.signature_repeat_threshold is {}: the first failure will halt its issue",
                self.retry.signature_repeat_threshold
            ));
        }
        if !(1..=MAX_LOCAL_ATTEMPTS as u32).contains(&self.retry.local_test_attempts) {
            warnings.push(format!(
                "retry.local_test_attempts is {}: expected 1 to {}",
                self.retry.local_test_attempts, MAX_LOCAL_ATTEMPTS
            ));
        }
        if self.retry.max_retries == 0 {
            warnings.push("retry.max_retries is 0: failed tasks are never re-dispatched".into());
        }
        if self.decomposition.max_tests_per_task == 0 {
            warnings.push("decomposition.max_tests_per_task is 0: treated as 1".into());
        }

        warnings
    }
}

/// Resolved configuration for one project.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub project_dir: PathBuf,
    pub orchestrator_dir: PathBuf,
    pub toml: ForemanToml,
    /// Warnings from environment overrides.
    pub env_warnings: Vec<String>,
    pub verbose: bool,
}

impl ForemanConfig {
    /// Load configuration for a project directory.
    pub fn new(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let orchestrator_dir = project_dir.join(ORCHESTRATOR_DIR);
        let mut toml = ForemanToml::load_or_default(&orchestrator_dir)?;
        let env_warnings = toml.apply_env();

        Ok(Self {
            project_dir,
            orchestrator_dir,
            toml,
            env_warnings,
            verbose: false,
        })
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.orchestrator_dir.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.orchestrator_dir.join("logs")
    }

    pub fn worker_cmd(&self) -> Option<&str> {
        self.toml.dispatch.worker_cmd.as_deref()
    }

    /// Requirements path resolved against the project directory.
    pub fn requirements_path(&self) -> Option<PathBuf> {
        self.toml
            .sources
            .requirements
            .as_ref()
            .map(|p| self.project_dir.join(p))
    }

    pub fn test_plan_path(&self) -> Option<PathBuf> {
        self.toml
            .sources
            .test_plan
            .as_ref()
            .map(|p| self.project_dir.join(p))
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let d = &self.toml.dispatch;
        DispatchConfig {
            max_parallel: d.max_parallel,
            gate_timeout: Duration::from_secs(d.gate_timeout_secs),
            poll_interval: Duration::from_millis(d.poll_interval_ms),
            local_test_attempts: self.toml.retry.local_test_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            signature_repeat_threshold: self.toml.retry.signature_repeat_threshold,
        }
    }

    pub fn decomposition_config(&self) -> DecompositionConfig {
        DecompositionConfig::default()
            .set_max_tests_per_task(self.toml.decomposition.max_tests_per_task)
            .set_default_complexity(self.toml.decomposition.default_complexity)
            .set_max_retries(self.toml.retry.max_retries)
    }

    /// Every validation and environment warning.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ForemanToml::parse("").unwrap();
        assert_eq!(config, ForemanToml::default());
        assert_eq!(config.dispatch.max_parallel, 4);
        assert_eq!(config.dispatch.gate_timeout_secs, 1800);
        assert_eq!(config.retry.max_retries, 10);
        assert_eq!(config.retry.signature_repeat_threshold, 3);
        assert_eq!(config.decomposition.max_tests_per_task, 15);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = ForemanToml::parse(
            r#"
[dispatch]
max_parallel = 8
gate_timeout_secs = 60
worker_cmd = "./worker.sh"

[retry]
signature_repeat_threshold = 5
local_test_attempts = 2

[decomposition]
max_tests_per_task = 10
default_complexity = "high"

[sources]
test_plan = "docs/plan.md"
"#,
        )
        .unwrap();
        assert_eq!(config.dispatch.max_parallel, 8);
        assert_eq!(config.dispatch.poll_interval_ms, 500);
        assert_eq!(config.dispatch.worker_cmd.as_deref(), Some("./worker.sh"));
        assert_eq!(config.retry.signature_repeat_threshold, 5);
        assert_eq!(config.retry.max_retries, 10);
        assert_eq!(config.decomposition.default_complexity, Complexity::High);
        assert_eq!(config.sources.test_plan, Some(PathBuf::from("docs/plan.md")));
        assert!(config.sources.requirements.is_none());
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(ForemanToml::parse("[dispatch\nmax_parallel = ").is_err());
    }

    #[test]
    fn test_validate_reports_each_problem() {
        let mut config = ForemanToml::default();
        config.dispatch.max_parallel = 0;
        config.dispatch.gate_timeout_secs = 0;
        config.retry.signature_repeat_threshold = 1;
        config.retry.local_test_attempts = 5;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("max_parallel")));
        assert!(warnings.iter().any(|w| w.contains("local_test_attempts")));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FOREMAN_MAX_PARALLEL", "2"),
            ("FOREMAN_WORKER_CMD", "run-worker"),
            ("FOREMAN_SIGNATURE_REPEAT_THRESHOLD", "many"),
        ]
        .into_iter()
        .collect();
        let mut config = ForemanToml::default();
        let warnings = config.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.dispatch.max_parallel, 2);
        assert_eq!(config.dispatch.worker_cmd.as_deref(), Some("run-worker"));
        assert_eq!(config.retry.signature_repeat_threshold, 3);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("FOREMAN_SIGNATURE_REPEAT_THRESHOLD"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = ForemanToml::default();
        config.dispatch.worker_cmd = Some("w".into());
        config.sources.requirements = Some(PathBuf::from("req.toml"));
        config.save(&path).unwrap();

        assert_eq!(ForemanToml::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, ForemanToml::default());
    }

    #[test]
    fn test_foreman_config_resolves_paths_and_sections() {
        let dir = tempdir().unwrap();
        let orch = dir.path().join(ORCHESTRATOR_DIR);
        std::fs::create_dir_all(&orch).unwrap();
        std::fs::write(
            orch.join(CONFIG_FILE),
            "[dispatch]\ngate_timeout_secs = 5\n[sources]\nrequirements = \"req.toml\"\n",
        )
        .unwrap();

        let config = ForemanConfig::new(dir.path()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.requirements_path(), Some(root.join("req.toml")));
        assert!(config.test_plan_path().is_none());
        assert_eq!(config.dispatch_config().gate_timeout, Duration::from_secs(5));
        assert_eq!(config.decomposition_config().max_retries, 10);
        assert_eq!(config.log_dir(), root.join(ORCHESTRATOR_DIR).join("logs"));
    }
}
