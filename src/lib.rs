//! Single-worker, fixed, elastic and scheduled task pools on top of Tokio,
//! with non-blocking handles, cooperative cancellation and graceful or
//! immediate shutdown.

mod error;
mod handle;
mod harness;
mod pool;
mod schedule;
mod task;

pub use error::{PoolError, TaskError};
pub use handle::TaskHandle;
pub use harness::{checked_div, failing_division, sleeping_action, Harness, HarnessConfig, HarnessReport, OutcomeTally};
pub use pool::{Pool, PoolKind, PoolState, ShutdownMode, DEFAULT_KEEP_ALIVE};
pub use schedule::PeriodicHandle;
pub use task::{Task, TaskToExecute};
