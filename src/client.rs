//! Scheduling API for embedders.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::{ExecutionId, Execution, ScheduledExecution, SchedulerError, TaskInstance};
use crate::store::ExecutionStore;

/// What a client call did to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEventType {
    /// A new execution was persisted.
    Schedule,
    /// An existing execution's due time was moved.
    Reschedule,
    /// An execution was removed.
    Cancel,
}

/// Emitted to the configured listener after a successful client mutation.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    /// What happened.
    pub event_type: ClientEventType,
    /// Identity of the affected execution.
    pub instance: ExecutionId,
    /// The (new) due time; absent for cancellations.
    pub execution_time: Option<DateTime<Utc>>,
}

/// Observer of client mutations. A single optional callback, invoked after
/// persistence.
pub trait ClientEventListener: Send + Sync {
    /// React to one client event.
    fn new_event(&self, event: &ClientEvent);
}

/// Listener that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClientEventListener;

impl ClientEventListener for NoopClientEventListener {
    fn new_event(&self, _event: &ClientEvent) {}
}

/// Schedule, reschedule, cancel, and inspect executions.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Persist a new execution due at `execution_time`. Returns `false` when
    /// an execution with the same identity already exists.
    async fn schedule(
        &self,
        instance: TaskInstance,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError>;

    /// Move an unpicked execution to a new due time, keeping its observation
    /// stamps. Returns `false` when the row is missing, picked, or changed
    /// concurrently (the last caller wins on unpicked rows).
    async fn reschedule(
        &self,
        id: &ExecutionId,
        new_execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError>;

    /// Remove an unpicked execution. Best-effort on picked rows: a cancel
    /// racing with a pick may leave the execution to run once.
    async fn cancel(&self, id: &ExecutionId) -> Result<bool, SchedulerError>;

    /// Look up one scheduled execution.
    async fn get_scheduled_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ScheduledExecution>, SchedulerError>;

    /// All scheduled executions for a task, ordered by due time.
    async fn get_scheduled_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<ScheduledExecution>, SchedulerError>;
}

/// Client writing through an [`ExecutionStore`] and notifying a listener.
pub struct StandardSchedulerClient {
    store: Arc<dyn ExecutionStore>,
    listener: Arc<dyn ClientEventListener>,
}

impl StandardSchedulerClient {
    /// A client over `store` notifying `listener` after mutations.
    pub fn new(store: Arc<dyn ExecutionStore>, listener: Arc<dyn ClientEventListener>) -> Self {
        Self { store, listener }
    }

    fn notify(
        &self,
        event_type: ClientEventType,
        instance: ExecutionId,
        execution_time: Option<DateTime<Utc>>,
    ) {
        self.listener.new_event(&ClientEvent {
            event_type,
            instance,
            execution_time,
        });
    }
}

#[async_trait]
impl SchedulerClient for StandardSchedulerClient {
    async fn schedule(
        &self,
        instance: TaskInstance,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let id = instance.id();
        let created = self
            .store
            .create_if_not_exists(&Execution::new(instance, execution_time))
            .await?;
        if created {
            self.notify(ClientEventType::Schedule, id, Some(execution_time));
        } else {
            debug!(execution = %id, "schedule skipped, execution already exists");
        }
        Ok(created)
    }

    async fn reschedule(
        &self,
        id: &ExecutionId,
        new_execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let Some(execution) = self
            .store
            .get_execution(&id.task_name, &id.instance_id)
            .await?
        else {
            warn!(execution = %id, "reschedule of unknown execution");
            return Ok(false);
        };
        if execution.picked {
            warn!(execution = %id, "reschedule of picked execution skipped");
            return Ok(false);
        }

        let rescheduled = self
            .store
            .reschedule(
                &execution,
                new_execution_time,
                None,
                execution.last_success,
                execution.last_failure,
                execution.consecutive_failures,
            )
            .await?;
        if rescheduled {
            self.notify(
                ClientEventType::Reschedule,
                id.clone(),
                Some(new_execution_time),
            );
        }
        Ok(rescheduled)
    }

    async fn cancel(&self, id: &ExecutionId) -> Result<bool, SchedulerError> {
        let Some(execution) = self
            .store
            .get_execution(&id.task_name, &id.instance_id)
            .await?
        else {
            warn!(execution = %id, "cancel of unknown execution");
            return Ok(false);
        };
        if execution.picked {
            warn!(execution = %id, "cancel of picked execution skipped (best-effort)");
            return Ok(false);
        }

        let removed = self.store.remove(&execution).await?;
        if removed {
            self.notify(ClientEventType::Cancel, id.clone(), None);
        }
        Ok(removed)
    }

    async fn get_scheduled_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ScheduledExecution>, SchedulerError> {
        Ok(self
            .store
            .get_execution(&id.task_name, &id.instance_id)
            .await?
            .map(ScheduledExecution::from))
    }

    async fn get_scheduled_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<ScheduledExecution>, SchedulerError> {
        Ok(self
            .store
            .get_executions_for_task(task_name)
            .await?
            .into_iter()
            .map(ScheduledExecution::from)
            .collect())
    }
}
