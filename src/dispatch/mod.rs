//! Scheduler and worker plumbing.
//!
//! - **executor** - the `TaskExecutor` seam and the external-command worker
//! - **worker** - local retries and marker publication on the worker side
//! - **dispatcher** - the bounded-slot scheduler loop with restart recovery
//! - **state** - progress events and run summaries
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use foreman::dispatch::{CommandExecutor, DispatchConfig, Dispatcher};
//! use foreman::retry::RetryPolicy;
//! use foreman::store::Store;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Store::open(".orchestrator")?;
//! let executor = Arc::new(CommandExecutor::new(
//!     "my-worker",
//!     std::path::Path::new("."),
//!     std::path::Path::new(".orchestrator"),
//! ));
//! let dispatcher = Dispatcher::new(store, executor, DispatchConfig::default(), RetryPolicy::default());
//! let summary = dispatcher.run_loop(1).await?;
//! println!("{} of {} tasks done", summary.done, summary.total);
//! # Ok(())
//! # }
//! ```

mod dispatcher;
mod executor;
mod state;
mod worker;

pub use dispatcher::{DispatchConfig, Dispatcher};
pub use executor::{
    AttemptContext, AttemptFailure, AttemptResult, CommandExecutor, TaskExecutor,
};
pub use state::{DispatchEvent, RunSummary};
pub use worker::{DEFAULT_LOCAL_TEST_ATTEMPTS, WorkerHarness, publish_blocking, publish_outcome};
