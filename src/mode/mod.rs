//! Mode selection for a decomposition cycle.
//!
//! The controller is stateless: it maps a trigger context to a mode and
//! the source document the decomposition engine reads. Rules, first match
//! wins:
//!
//! 1. an explicit mode
//! 2. an external test plan ⇒ `external_spec`
//! 3. any decomposable critical issue ⇒ `critical_only`
//! 4. no prior loop ⇒ `initial`
//! 5. otherwise `improvement_loop`

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::DecompositionError;

/// Decomposition strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// First cycle from a requirements document.
    Initial,
    /// Remediate the open issue backlog.
    ImprovementLoop,
    /// Remediate critical issues only.
    CriticalOnly,
    /// Build from an external test plan with exact coverage.
    ExternalSpec,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::ImprovementLoop => "improvement_loop",
            Self::CriticalOnly => "critical_only",
            Self::ExternalSpec => "external_spec",
        }
    }

    pub fn all() -> [Mode; 4] {
        [
            Self::Initial,
            Self::ImprovementLoop,
            Self::CriticalOnly,
            Self::ExternalSpec,
        ]
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::all()
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown mode '{}' (expected one of: initial, improvement_loop, critical_only, external_spec)",
                    s
                )
            })
    }
}

/// What a decomposition cycle reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDocument {
    Requirements(PathBuf),
    TestPlan(PathBuf),
    IssueBacklog,
}

impl fmt::Display for SourceDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requirements(p) => write!(f, "requirements {}", p.display()),
            Self::TestPlan(p) => write!(f, "test plan {}", p.display()),
            Self::IssueBacklog => f.write_str("issue backlog"),
        }
    }
}

/// Facts the controller decides from.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub explicit: Option<Mode>,
    pub requirements: Option<PathBuf>,
    pub test_plan: Option<PathBuf>,
    /// Decomposable critical issues in the backlog.
    pub critical_backlog: usize,
    /// Loops already planned.
    pub prior_loops: usize,
}

impl TriggerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_explicit(mut self, mode: Option<Mode>) -> Self {
        self.explicit = mode;
        self
    }

    pub fn with_requirements(mut self, path: Option<PathBuf>) -> Self {
        self.requirements = path;
        self
    }

    pub fn with_test_plan(mut self, path: Option<PathBuf>) -> Self {
        self.test_plan = path;
        self
    }

    pub fn with_critical_backlog(mut self, count: usize) -> Self {
        self.critical_backlog = count;
        self
    }

    pub fn with_prior_loops(mut self, count: usize) -> Self {
        self.prior_loops = count;
        self
    }
}

/// The controller's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSelection {
    pub mode: Mode,
    pub source: SourceDocument,
    /// Which rule fired, for logs and `plan` output.
    pub reason: &'static str,
}

pub struct ModeController;

impl ModeController {
    pub fn select(ctx: &TriggerContext) -> Result<ModeSelection, DecompositionError> {
        if let Some(mode) = ctx.explicit {
            return Ok(ModeSelection {
                mode,
                source: Self::source_for(mode, ctx)?,
                reason: "explicit mode",
            });
        }

        let (mode, reason) = if ctx.test_plan.is_some() {
            (Mode::ExternalSpec, "external test plan provided")
        } else if ctx.critical_backlog > 0 {
            (Mode::CriticalOnly, "critical issues in backlog")
        } else if ctx.prior_loops == 0 {
            (Mode::Initial, "no prior loop")
        } else {
            (Mode::ImprovementLoop, "continuing from prior loop")
        };

        Ok(ModeSelection {
            mode,
            source: Self::source_for(mode, ctx)?,
            reason,
        })
    }

    fn source_for(mode: Mode, ctx: &TriggerContext) -> Result<SourceDocument, DecompositionError> {
        let missing = |what| DecompositionError::MissingSource {
            mode: mode.to_string(),
            what,
        };
        match mode {
            Mode::Initial => ctx
                .requirements
                .clone()
                .map(SourceDocument::Requirements)
                .ok_or_else(|| missing("a requirements document")),
            Mode::ExternalSpec => ctx
                .test_plan
                .clone()
                .map(SourceDocument::TestPlan)
                .ok_or_else(|| missing("a test plan")),
            Mode::ImprovementLoop | Mode::CriticalOnly => Ok(SourceDocument::IssueBacklog),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> TriggerContext {
        TriggerContext::new().with_requirements(Some(PathBuf::from("req.toml")))
    }

    #[test]
    fn test_explicit_mode_wins() {
        let ctx = base()
            .with_explicit(Some(Mode::ImprovementLoop))
            .with_critical_backlog(3);
        let sel = ModeController::select(&ctx).unwrap();
        assert_eq!(sel.mode, Mode::ImprovementLoop);
        assert_eq!(sel.source, SourceDocument::IssueBacklog);
    }

    #[test]
    fn test_test_plan_selects_external_spec() {
        let ctx = base()
            .with_test_plan(Some(PathBuf::from("plan.md")))
            .with_critical_backlog(1);
        let sel = ModeController::select(&ctx).unwrap();
        assert_eq!(sel.mode, Mode::ExternalSpec);
        assert_eq!(sel.source, SourceDocument::TestPlan(PathBuf::from("plan.md")));
    }

    #[test]
    fn test_critical_backlog_selects_critical_only() {
        let ctx = base().with_critical_backlog(2).with_prior_loops(1);
        assert_eq!(ModeController::select(&ctx).unwrap().mode, Mode::CriticalOnly);
    }

    #[test]
    fn test_first_loop_is_initial() {
        let sel = ModeController::select(&base()).unwrap();
        assert_eq!(sel.mode, Mode::Initial);
        assert_eq!(
            sel.source,
            SourceDocument::Requirements(PathBuf::from("req.toml"))
        );
    }

    #[test]
    fn test_later_loop_is_improvement() {
        let ctx = base().with_prior_loops(3);
        assert_eq!(
            ModeController::select(&ctx).unwrap().mode,
            Mode::ImprovementLoop
        );
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let ctx = TriggerContext::new().with_explicit(Some(Mode::ExternalSpec));
        assert!(matches!(
            ModeController::select(&ctx),
            Err(DecompositionError::MissingSource { .. })
        ));
        assert!(ModeController::select(&TriggerContext::new()).is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("critical-only".parse::<Mode>().unwrap(), Mode::CriticalOnly);
        assert_eq!("External_Spec".parse::<Mode>().unwrap(), Mode::ExternalSpec);
        assert!("sometimes".parse::<Mode>().is_err());
    }
}
