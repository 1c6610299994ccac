//! Per-task policies: completion, failure, and dead-execution handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::{AppResult, Execution, ExecutionComplete, ExecutionOutcome, SchedulerError};
use crate::store::ExecutionStore;
use crate::task::schedule::Schedule;

/// Thin persistence facade handed to handlers after a run.
///
/// Operations are version-checked against the execution the handler was
/// invoked for; a lost race means a peer already acted on the row. The
/// current instant comes from the scheduler's injected clock, so handlers
/// never read wall time themselves.
pub struct ExecutionOperations {
    store: Arc<dyn ExecutionStore>,
    execution: Execution,
    now: DateTime<Utc>,
}

impl ExecutionOperations {
    /// Operations bound to one picked (or recovered) execution, with `now`
    /// read from the scheduler's clock at invocation time.
    pub fn new(store: Arc<dyn ExecutionStore>, execution: Execution, now: DateTime<Utc>) -> Self {
        Self {
            store,
            execution,
            now,
        }
    }

    /// The execution these operations act on.
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// The scheduler-clock instant at which the handler was invoked.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Delete the row: the instance is finished.
    pub async fn stop(&self) -> Result<bool, SchedulerError> {
        self.store.remove(&self.execution).await
    }

    /// Release the row for a future run at `next_execution_time`, updating
    /// the observation stamps from the run outcome: success resets the
    /// failure counter, failure increments it.
    pub async fn reschedule(
        &self,
        complete: &ExecutionComplete,
        next_execution_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, SchedulerError> {
        self.reschedule_with_payload(complete, next_execution_time, None)
            .await
    }

    /// Like [`Self::reschedule`], also replacing the stored payload.
    pub async fn reschedule_with_payload(
        &self,
        complete: &ExecutionComplete,
        next_execution_time: chrono::DateTime<chrono::Utc>,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let execution = &self.execution;
        let (last_success, last_failure, consecutive_failures) = match complete.outcome {
            ExecutionOutcome::Success => (Some(complete.time_done), execution.last_failure, 0),
            ExecutionOutcome::Failure { .. } => (
                execution.last_success,
                Some(complete.time_done),
                execution.consecutive_failures + 1,
            ),
        };
        self.store
            .reschedule(
                execution,
                next_execution_time,
                new_payload,
                last_success,
                last_failure,
                consecutive_failures,
            )
            .await
    }

    /// Replace the stored payload without releasing the row.
    pub async fn update_payload(&self, new_payload: Option<Vec<u8>>) -> Result<bool, SchedulerError> {
        self.store.update_payload(&self.execution, new_payload).await
    }
}

/// Decides what happens to the row after a successful run.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Act on a successful completion.
    async fn complete(&self, complete: ExecutionComplete, ops: &ExecutionOperations)
        -> AppResult<()>;
}

/// Decides what happens to the row after a failed run.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// Act on a failed completion.
    async fn on_failure(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> AppResult<()>;
}

/// Recovers a picked row whose owner stopped heartbeating.
#[async_trait]
pub trait DeadExecutionHandler: Send + Sync {
    /// Act on an abandoned execution.
    async fn dead_execution(&self, execution: Execution, ops: &ExecutionOperations)
        -> AppResult<()>;
}

/// Completion policy for one-time tasks: delete the row.
pub struct OnCompleteRemove;

#[async_trait]
impl CompletionHandler for OnCompleteRemove {
    async fn complete(
        &self,
        _complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        ops.stop().await?;
        Ok(())
    }
}

/// Completion policy for recurring tasks: release for the schedule's next
/// occurrence.
pub struct OnCompleteReschedule {
    schedule: Arc<dyn Schedule>,
}

impl OnCompleteReschedule {
    /// Reschedule per `schedule` after each success.
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl CompletionHandler for OnCompleteReschedule {
    async fn complete(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        let next = self.schedule.next_execution_time(complete.time_done);
        debug!(execution = %complete.execution.id(), next = %next, "rescheduling after success");
        ops.reschedule(&complete, next).await?;
        Ok(())
    }
}

/// Retry a fixed delay after each failure.
pub struct OnFailureRetryLater {
    delay: Duration,
}

impl OnFailureRetryLater {
    /// Retry `delay` after the failure time.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl FailureHandler for OnFailureRetryLater {
    async fn on_failure(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        let next = complete.time_done
            + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero());
        debug!(execution = %complete.execution.id(), next = %next, "retrying after failure");
        ops.reschedule(&complete, next).await?;
        Ok(())
    }
}

/// Retry per the task's schedule after a failure, losing no recurrence slot.
pub struct OnFailureReschedule {
    schedule: Arc<dyn Schedule>,
}

impl OnFailureReschedule {
    /// Reschedule per `schedule` after each failure.
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl FailureHandler for OnFailureReschedule {
    async fn on_failure(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        let next = self.schedule.next_execution_time(complete.time_done);
        debug!(execution = %complete.execution.id(), next = %next, "rescheduling after failure");
        ops.reschedule(&complete, next).await?;
        Ok(())
    }
}

/// Retry with `base * 2^consecutive_failures`, capped at `max`.
pub struct OnFailureExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl OnFailureExponentialBackoff {
    /// Backoff starting at `base`, never exceeding `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let factor = 2u32.checked_pow(consecutive_failures.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

#[async_trait]
impl FailureHandler for OnFailureExponentialBackoff {
    async fn on_failure(
        &self,
        complete: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        let delay = self.delay_for(complete.execution.consecutive_failures);
        let next = complete.time_done
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        debug!(
            execution = %complete.execution.id(),
            failures = complete.execution.consecutive_failures,
            next = %next,
            "backing off after failure"
        );
        ops.reschedule(&complete, next).await?;
        Ok(())
    }
}

/// Default recovery for recurring tasks: clear the pick and run now.
pub struct RescheduleDeadExecution;

#[async_trait]
impl DeadExecutionHandler for RescheduleDeadExecution {
    async fn dead_execution(
        &self,
        execution: Execution,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        let now = ops.now();
        info!(execution = %execution.id(), "rescheduling dead execution");
        let complete = ExecutionComplete::failure(
            execution,
            now,
            anyhow::anyhow!("execution abandoned by its owner"),
        );
        ops.reschedule(&complete, now).await?;
        Ok(())
    }
}

/// Recovery that removes the abandoned row.
pub struct CancelDeadExecution;

#[async_trait]
impl DeadExecutionHandler for CancelDeadExecution {
    async fn dead_execution(
        &self,
        execution: Execution,
        ops: &ExecutionOperations,
    ) -> AppResult<()> {
        info!(execution = %execution.id(), "cancelling dead execution");
        ops.stop().await?;
        Ok(())
    }
}
