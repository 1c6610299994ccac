//! # Taskloom
//!
//! Persistent, cluster-safe task scheduling on top of a relational database.
//!
//! Taskloom durably records future task executions and guarantees each due
//! execution runs to completion on exactly one participating process, even
//! when processes die mid-execution. Coordination happens entirely through
//! the shared [`store::ExecutionStore`]: a version-checked pick assigns work,
//! heartbeats prove liveness, and abandoned executions are recovered by
//! per-task dead-execution policies.
//!
//! ## Modules
//!
//! - [`scheduler`] - lifecycle, background loops, and the worker pool
//! - [`store`] - the durable execution store (in-memory and Postgres)
//! - [`task`] - task definitions, schedules, and handler policies
//! - [`client`] - the schedule/reschedule/cancel API
//! - [`config`] - plain configuration records with defaults
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use taskloom::{
//!     FnHandler, InMemoryExecutionStore, Scheduler, SchedulerClient, SchedulerConfig, Task,
//! };
//!
//! # async fn run() -> Result<(), taskloom::SchedulerError> {
//! let send_report = Task::one_time(
//!     "send-report",
//!     Arc::new(FnHandler(|instance: &taskloom::TaskInstance,
//!                         _ctx: &taskloom::ExecutionContext|
//!      -> anyhow::Result<()> {
//!         println!("sending report {}", instance.instance_id);
//!         Ok(())
//!     })),
//! );
//!
//! let store = Arc::new(InMemoryExecutionStore::new("reporting-1"));
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::new()
//!         .with_threads(4)
//!         .with_polling_interval(Duration::from_secs(1)),
//!     store,
//!     vec![send_report],
//! )?;
//!
//! scheduler.start();
//! let instance = taskloom::TaskInstance::new("send-report", "monthly-42");
//! scheduler
//!     .schedule(instance, chrono::Utc::now() + chrono::Duration::seconds(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod core;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod util;

// Re-export the main types for convenience.
pub use client::{
    ClientEvent, ClientEventListener, ClientEventType, NoopClientEventListener, SchedulerClient,
    StandardSchedulerClient,
};
pub use config::{PollStrategy, PollStrategyConfig, SchedulerConfig};
pub use crate::core::{
    AppResult, AtomicStatsSink, CurrentlyExecuting, Execution, ExecutionComplete, ExecutionId,
    ExecutionOutcome, NoopStatsSink, ScheduledExecution, SchedulerError, StatsEvent, StatsSink,
    StatsSnapshot, TaskInstance, Waiter,
};
pub use scheduler::{ExecutionContext, Scheduler, SchedulerLifecycle, SchedulerState};
pub use store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};
pub use task::handlers::{
    CancelDeadExecution, CompletionHandler, DeadExecutionHandler, ExecutionOperations,
    FailureHandler, OnCompleteRemove, OnCompleteReschedule, OnFailureExponentialBackoff,
    OnFailureReschedule, OnFailureRetryLater, RescheduleDeadExecution,
};
pub use task::registry::TaskRegistry;
pub use task::schedule::{Daily, FixedDelay, Schedule};
pub use task::serializer::{JsonSerializer, Serializer};
pub use task::{ExecutionHandler, FnHandler, Task, RECURRING_INSTANCE};
pub use util::{Clock, ManualClock, SharedClock, SystemClock};
