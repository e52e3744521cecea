//! Source documents the decomposition engine reads.
//!
//! ## Requirements (TOML)
//!
//! ```toml
//! [[features]]
//! name = "Authentication"
//! category = "auth"
//! complexity = "high"
//! build = ["Login endpoint", "Session store"]
//! tests = ["AUTH-001", "AUTH-002"]
//! integration_level = "integration"
//! mock_policy = "forbidden"
//! depends_on = ["Storage"]
//! ```
//!
//! ## Test plan (markdown)
//!
//! `##` and `###` headings open a category; every test identifier
//! (`AUTH-001`, `PAY2-0042`) found on a list item or table row belongs to the
//! current category.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::DecompositionError;
use crate::store::{Complexity, IntegrationLevel, MockPolicy};

static TEST_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Z0-9]*-\d{2,4}\b").expect("valid test id regex"));

static HEADING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{2,3}\s+(.+?)\s*#*$").expect("valid heading regex"));

/// Category for identifiers listed before the first heading.
pub const DEFAULT_CATEGORY: &str = "general";

/// One feature of a requirements document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    /// Build items; one task each.
    #[serde(default)]
    pub build: Vec<String>,
    /// Test identifiers that verify this feature.
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub integration_level: Option<IntegrationLevel>,
    #[serde(default)]
    pub mock_policy: Option<MockPolicy>,
    /// Names of features whose build tasks must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Feature {
    /// Explicit category, or the slugged feature name.
    pub fn category(&self) -> String {
        self.category
            .clone()
            .unwrap_or_else(|| slugify(&self.name))
    }
}

/// The `initial` mode source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl Requirements {
    pub fn load(path: &Path) -> Result<Self, DecompositionError> {
        let content = read_source(path)?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, DecompositionError> {
        let requirements: Requirements =
            toml::from_str(content).map_err(|e| DecompositionError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        debug!(
            path = %path.display(),
            features = requirements.features.len(),
            "Loaded requirements"
        );
        Ok(requirements)
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Every declared test identifier.
    pub fn test_ids(&self) -> BTreeSet<String> {
        self.features
            .iter()
            .flat_map(|f| f.tests.iter().cloned())
            .collect()
    }
}

/// A group of test identifiers under one heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCategory {
    pub name: String,
    pub ids: Vec<String>,
}

impl TestCategory {
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}

/// The `external_spec` mode source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestPlan {
    pub path: PathBuf,
    pub categories: Vec<TestCategory>,
}

impl TestPlan {
    pub fn load(path: &Path) -> Result<Self, DecompositionError> {
        let content = read_source(path)?;
        let mut plan = Self::parse_markdown(&content);
        plan.path = path.to_path_buf();
        debug!(
            path = %path.display(),
            categories = plan.categories.len(),
            tests = plan.total(),
            "Loaded test plan"
        );
        Ok(plan)
    }

    /// Extract categories and identifiers from a markdown plan.
    ///
    /// An identifier listed twice is kept in its first category only.
    pub fn parse_markdown(content: &str) -> Self {
        let mut categories: Vec<TestCategory> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut current = DEFAULT_CATEGORY.to_string();

        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(caps) = HEADING_PATTERN.captures(trimmed) {
                current = caps[1].to_string();
                continue;
            }
            if !is_item_line(trimmed) {
                continue;
            }
            for m in TEST_ID_PATTERN.find_iter(trimmed) {
                let id = m.as_str().to_string();
                if !seen.insert(id.clone()) {
                    warn!(test_id = %id, category = %current, "Duplicate test identifier in plan; keeping first");
                    continue;
                }
                match categories.iter_mut().find(|c| c.name == current) {
                    Some(category) => category.ids.push(id),
                    None => categories.push(TestCategory {
                        name: current.clone(),
                        ids: vec![id],
                    }),
                }
            }
        }

        Self {
            path: PathBuf::new(),
            categories,
        }
    }

    pub fn all_ids(&self) -> BTreeSet<String> {
        self.categories
            .iter()
            .flat_map(|c| c.ids.iter().cloned())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.categories.iter().map(|c| c.ids.len()).sum()
    }
}

fn is_item_line(line: &str) -> bool {
    line.starts_with('-')
        || line.starts_with('*')
        || line.starts_with('|')
        || line
            .split_once(". ")
            .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn read_source(path: &Path) -> Result<String, DecompositionError> {
    std::fs::read_to_string(path).map_err(|e| DecompositionError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Lowercase, hyphen-separated form of a heading or feature name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        DEFAULT_CATEGORY.to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const REQUIREMENTS: &str = r#"
[[features]]
name = "Storage Layer"
build = ["Schema", "Migrations"]
tests = ["STORE-001", "STORE-002"]

[[features]]
name = "Authentication"
category = "auth"
complexity = "high"
tests = ["AUTH-001"]
integration_level = "integration"
mock_policy = "forbidden"
depends_on = ["Storage Layer"]
"#;

    #[test]
    fn test_parse_requirements() {
        let req = Requirements::parse(REQUIREMENTS, Path::new("req.toml")).unwrap();
        assert_eq!(req.features.len(), 2);
        assert_eq!(req.features[0].category(), "storage-layer");
        assert_eq!(req.features[0].build.len(), 2);

        let auth = req.feature("Authentication").unwrap();
        assert_eq!(auth.category(), "auth");
        assert_eq!(auth.complexity, Some(Complexity::High));
        assert_eq!(auth.mock_policy, Some(MockPolicy::Forbidden));
        assert_eq!(auth.depends_on, vec!["Storage Layer".to_string()]);
        assert_eq!(req.test_ids().len(), 3);
    }

    #[test]
    fn test_parse_requirements_rejects_bad_toml() {
        let err = Requirements::parse("[[features]\nname =", Path::new("bad.toml")).unwrap_err();
        match err {
            DecompositionError::Parse { path, .. } => assert_eq!(path, PathBuf::from("bad.toml")),
            other => panic!("Expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file_is_parse_error() {
        let err = Requirements::load(Path::new("/nonexistent/req.toml")).unwrap_err();
        assert!(matches!(err, DecompositionError::Parse { .. }));
    }

    #[test]
    fn test_parse_markdown_plan() {
        let plan = TestPlan::parse_markdown(
            "# Test Plan\n\
             Intro mentions AUTH-999 in prose, which is ignored.\n\
             \n\
             ## Authentication\n\
             - AUTH-001 login succeeds\n\
             - AUTH-002 login fails with bad password\n\
             \n\
             ### Payments\n\
             | ID | Description |\n\
             |----|-------------|\n\
             | PAY-001 | charge card |\n\
             | PAY-002 | refund |\n\
             1. PAY-003 partial refund\n",
        );
        assert_eq!(plan.categories.len(), 2);
        assert_eq!(plan.categories[0].name, "Authentication");
        assert_eq!(plan.categories[0].ids, vec!["AUTH-001", "AUTH-002"]);
        assert_eq!(plan.categories[1].slug(), "payments");
        assert_eq!(plan.categories[1].ids.len(), 3);
        assert_eq!(plan.total(), 5);
        assert!(!plan.all_ids().contains("AUTH-999"));
    }

    #[test]
    fn test_duplicate_ids_kept_once() {
        let plan = TestPlan::parse_markdown(
            "## A\n- X-01\n- X-02\n## B\n- X-01 again\n- Y-01\n",
        );
        assert_eq!(plan.total(), 3);
        assert_eq!(plan.categories[0].ids, vec!["X-01", "X-02"]);
        assert_eq!(plan.categories[1].ids, vec!["Y-01"]);
    }

    #[test]
    fn test_ids_before_heading_use_default_category() {
        let plan = TestPlan::parse_markdown("- CORE-01 boot\n");
        assert_eq!(plan.categories[0].name, DEFAULT_CATEGORY);
    }

    #[test]
    fn test_load_plan_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "## Search\n- SRCH-001\n- SRCH-002").unwrap();
        let plan = TestPlan::load(file.path()).unwrap();
        assert_eq!(plan.path, file.path());
        assert_eq!(plan.total(), 2);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("User Accounts & Billing"), "user-accounts-billing");
        assert_eq!(slugify("  !!"), DEFAULT_CATEGORY);
    }
}
