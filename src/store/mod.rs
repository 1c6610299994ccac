//! Durable persistence of executions.
//!
//! The store is the coordination point between competing schedulers: the
//! version-checked [`ExecutionStore::pick`] update is the linearization point
//! that assigns an execution to exactly one process. All operations are
//! individually transactional; correctness never requires a multi-row
//! transaction.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::{Execution, SchedulerError};

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;

/// Durable execution storage with an optimistic picking protocol.
///
/// Conditional operations that lose the version race return a non-fatal
/// "stale" result (`Ok(false)` or `Ok(None)`); callers treat it as "someone
/// else has it" and move on.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert atomically; returns whether the insertion happened. Concurrent
    /// callers with the same identity see exactly one winner.
    async fn create_if_not_exists(&self, execution: &Execution) -> Result<bool, SchedulerError>;

    /// Up to `limit` unpicked rows with `execution_time <= now`, ordered by
    /// due time ascending. No locking; this is a candidate list.
    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Atomic conditional claim: sets `picked`, `picked_by`, `last_heartbeat`
    /// and bumps `version`, predicated on the observed version and
    /// `picked = false`. Returns the updated row, or `None` on a lost race.
    async fn pick(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>, SchedulerError>;

    /// Fused fetch-and-claim for backends supporting `SELECT ... FOR UPDATE
    /// SKIP LOCKED`. Semantically equivalent to `get_due` plus `pick` per
    /// row. Stores without such support return
    /// [`SchedulerError::UnsupportedOperation`]; the poll loop falls back.
    async fn pick_due(
        &self,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        Err(SchedulerError::UnsupportedOperation("pick_due"))
    }

    /// Unconditional liveness refresh for an owned row. A missing row is
    /// logged, not an error.
    async fn update_heartbeat(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Picked rows whose `last_heartbeat` is older than `older_than`.
    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Diagnostic listing: unpicked rows with `consecutive_failures > 0`
    /// whose `last_success` is absent or older than `now - duration`.
    async fn get_executions_failing_longer_than(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Version-checked release: clears the pick, bumps the version, moves the
    /// due time forward and updates the observation stamps. `new_payload`
    /// replaces the stored payload when present. Returns `false` on a lost
    /// version race.
    #[allow(clippy::too_many_arguments)]
    async fn reschedule(
        &self,
        execution: &Execution,
        next_execution_time: DateTime<Utc>,
        new_payload: Option<Vec<u8>>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: u32,
    ) -> Result<bool, SchedulerError>;

    /// Version-checked delete. Returns `false` on a lost version race.
    async fn remove(&self, execution: &Execution) -> Result<bool, SchedulerError>;

    /// Version-checked payload replacement for tasks that mutate state across
    /// runs. Returns `false` on a lost version race.
    async fn update_payload(
        &self,
        execution: &Execution,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError>;

    /// Look up one row by identity.
    async fn get_execution(
        &self,
        task_name: &str,
        instance_id: &str,
    ) -> Result<Option<Execution>, SchedulerError>;

    /// All rows for a task name, ordered by due time ascending.
    async fn get_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError>;
}
