//! Completion gate: the rendezvous between workers and the dispatcher.
//!
//! A worker publishes exactly one terminal marker per key; the dispatcher
//! awaits it with a bounded budget. `Timeout` is distinct from `Failure`.
//!
//! Publishing is two steps. A `.claim` file created with `create_new`
//! reserves the key for one publisher across processes and outcomes; only
//! the claim holder writes the failure report and then the marker.

mod completion;
mod marker;

pub use completion::CompletionGate;
pub use marker::{
    CLAIM_EXTENSION, COMPLETE_DIR, GateOutcome, MARKER_CONTENT, MarkerKey, Outcome, Publication,
    complete_dir,
};
