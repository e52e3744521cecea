//! Retry and failure-dedup engine.
//!
//! - **signature** - failure kinds, root causes and their digests
//! - **report** - per-dispatch failure reports stored beside the markers
//! - **analyst** - the collaborator that turns failures into issues
//! - **engine** - retry vs. escalate vs. halt

mod analyst;
mod engine;
mod report;
mod signature;

pub use analyst::{DefaultAnalyst, Disposition, FailureAnalyst};
pub use engine::{DEFAULT_REPEAT_THRESHOLD, RetryEngine, RetryPolicy, RetryState, Verdict};
pub use report::{
    Attempt, FailureReport, MAX_LOCAL_ATTEMPTS, read_report, report_path, write_report,
};
pub use signature::{FailureKind, FailureSignature, RootCause};
