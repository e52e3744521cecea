//! Failure taxonomy and signatures.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest.
const SIGNATURE_LEN: usize = 16;

/// Field separator inside the hashed material.
const UNIT_SEPARATOR: char = '\u{1f}';

/// Orchestrator-visible failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailure,
    TypeFailure,
    TestFailure,
    Timeout,
    EvidenceTamperDetected,
    DependencyMissing,
}

impl FailureKind {
    /// Categories that escalate on first occurrence without an
    /// orchestrator-level retry.
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Self::BuildFailure
                | Self::TypeFailure
                | Self::DependencyMissing
                | Self::EvidenceTamperDetected
        )
    }

    /// Whether the worker retries locally before reporting.
    pub fn retries_locally(&self) -> bool {
        matches!(self, Self::TestFailure)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BuildFailure => "build_failure",
            Self::TypeFailure => "type_failure",
            Self::TestFailure => "test_failure",
            Self::Timeout => "timeout",
            Self::EvidenceTamperDetected => "evidence_tamper_detected",
            Self::DependencyMissing => "dependency_missing",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "build_failure" | "build" => Ok(Self::BuildFailure),
            "type_failure" | "type" => Ok(Self::TypeFailure),
            "test_failure" | "test" => Ok(Self::TestFailure),
            "timeout" => Ok(Self::Timeout),
            "evidence_tamper_detected" | "tamper" => Ok(Self::EvidenceTamperDetected),
            "dependency_missing" | "dependency" => Ok(Self::DependencyMissing),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

/// The four facts a signature is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RootCause {
    pub root_cause_type: String,
    pub primary_error: String,
    #[serde(default)]
    pub failing_identifier: String,
    #[serde(default)]
    pub affected_artifact: String,
}

impl RootCause {
    pub fn new(
        root_cause_type: &str,
        primary_error: &str,
        failing_identifier: &str,
        affected_artifact: &str,
    ) -> Self {
        Self {
            root_cause_type: root_cause_type.to_string(),
            primary_error: primary_error.to_string(),
            failing_identifier: failing_identifier.to_string(),
            affected_artifact: affected_artifact.to_string(),
        }
    }

    pub fn signature(&self) -> FailureSignature {
        FailureSignature::compute(self)
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut out = format!("{}: {}", self.root_cause_type, self.primary_error.trim());
        if !self.failing_identifier.is_empty() {
            out.push_str(&format!(" ({})", self.failing_identifier));
        }
        if !self.affected_artifact.is_empty() {
            out.push_str(&format!(" in {}", self.affected_artifact));
        }
        out
    }
}

/// Fixed-length digest of a `RootCause`. Only compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureSignature(String);

impl FailureSignature {
    pub fn compute(cause: &RootCause) -> Self {
        let material = [
            cause.root_cause_type.trim(),
            cause.primary_error.trim(),
            cause.failing_identifier.trim(),
            cause.affected_artifact.trim(),
        ]
        .join(&UNIT_SEPARATOR.to_string());

        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        Self(hex[..SIGNATURE_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
