//! Core data model, errors, and concurrency primitives.

pub mod error;
pub mod execution;
pub mod permits;
pub mod stats;
pub mod waiter;

pub use error::{AppResult, SchedulerError};
pub use execution::{
    CurrentlyExecuting, Execution, ExecutionComplete, ExecutionId, ExecutionOutcome,
    ScheduledExecution, TaskInstance,
};
pub use permits::Permits;
pub use stats::{AtomicStatsSink, NoopStatsSink, StatsEvent, StatsSink, StatsSnapshot};
pub use waiter::Waiter;
