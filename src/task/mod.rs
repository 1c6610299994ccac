//! Task definitions: a named task, its execution handler, and its
//! completion, failure, and dead-execution policies.
//!
//! A task is a single value parameterized by its handlers; the factory
//! constructors ([`Task::one_time`], [`Task::recurring`], [`Task::custom`])
//! only differ in the policies they install.

pub mod handlers;
pub mod registry;
pub mod schedule;
pub mod serializer;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::{AppResult, SchedulerError, TaskInstance};
use crate::scheduler::ExecutionContext;

use handlers::{
    CompletionHandler, DeadExecutionHandler, FailureHandler, OnCompleteRemove,
    OnCompleteReschedule, OnFailureReschedule, OnFailureRetryLater, RescheduleDeadExecution,
};
use schedule::Schedule;
use serializer::{deserialize_payload, serialize_payload, JsonSerializer, Serializer};

pub use handlers::ExecutionOperations;

/// Instance id used when a recurring task's row is auto-inserted on startup.
pub const RECURRING_INSTANCE: &str = "recurring";

/// Default retry delay installed on tasks without an explicit failure policy.
const DEFAULT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Executes the business logic of one task invocation.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    /// Run one invocation. Returning an error routes the execution to the
    /// task's failure handler.
    async fn execute(&self, instance: &TaskInstance, ctx: &ExecutionContext) -> AppResult<()>;
}

/// Adapter turning a plain closure into an [`ExecutionHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ExecutionHandler for FnHandler<F>
where
    F: Fn(&TaskInstance, &ExecutionContext) -> AppResult<()> + Send + Sync,
{
    async fn execute(&self, instance: &TaskInstance, ctx: &ExecutionContext) -> AppResult<()> {
        (self.0)(instance, ctx)
    }
}

/// A named task definition.
pub struct Task {
    name: String,
    handler: Arc<dyn ExecutionHandler>,
    completion_handler: Arc<dyn CompletionHandler>,
    failure_handler: Arc<dyn FailureHandler>,
    dead_execution_handler: Arc<dyn DeadExecutionHandler>,
    serializer: Arc<dyn Serializer>,
    schedule: Option<Arc<dyn Schedule>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name).finish()
    }
}

impl Task {
    /// A task that runs once and deletes its row on success.
    pub fn one_time(name: impl Into<String>, handler: Arc<dyn ExecutionHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            completion_handler: Arc::new(OnCompleteRemove),
            failure_handler: Arc::new(OnFailureRetryLater::new(DEFAULT_RETRY_DELAY)),
            dead_execution_handler: Arc::new(RescheduleDeadExecution),
            serializer: Arc::new(JsonSerializer),
            schedule: None,
        }
    }

    /// A task that reschedules itself per `schedule` after every run,
    /// including failed ones. Dead executions are rescheduled to run
    /// immediately.
    pub fn recurring(
        name: impl Into<String>,
        schedule: Arc<dyn Schedule>,
        handler: Arc<dyn ExecutionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            completion_handler: Arc::new(OnCompleteReschedule::new(Arc::clone(&schedule))),
            failure_handler: Arc::new(OnFailureReschedule::new(Arc::clone(&schedule))),
            dead_execution_handler: Arc::new(RescheduleDeadExecution),
            serializer: Arc::new(JsonSerializer),
            schedule: Some(schedule),
        }
    }

    /// A task with a caller-supplied completion policy.
    pub fn custom(
        name: impl Into<String>,
        completion_handler: Arc<dyn CompletionHandler>,
        handler: Arc<dyn ExecutionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            completion_handler,
            failure_handler: Arc::new(OnFailureRetryLater::new(DEFAULT_RETRY_DELAY)),
            dead_execution_handler: Arc::new(RescheduleDeadExecution),
            serializer: Arc::new(JsonSerializer),
            schedule: None,
        }
    }

    /// Replace the failure policy.
    #[must_use]
    pub fn with_failure_handler(mut self, failure_handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = failure_handler;
        self
    }

    /// Replace the dead-execution policy.
    #[must_use]
    pub fn with_dead_execution_handler(
        mut self,
        dead_execution_handler: Arc<dyn DeadExecutionHandler>,
    ) -> Self {
        self.dead_execution_handler = dead_execution_handler;
        self
    }

    /// Replace the payload codec.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// The unique task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The recurrence schedule, present on recurring tasks.
    pub fn schedule(&self) -> Option<&Arc<dyn Schedule>> {
        self.schedule.as_ref()
    }

    /// The payload codec for this task.
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ExecutionHandler> {
        &self.handler
    }

    pub(crate) fn completion_handler(&self) -> &Arc<dyn CompletionHandler> {
        &self.completion_handler
    }

    pub(crate) fn failure_handler(&self) -> &Arc<dyn FailureHandler> {
        &self.failure_handler
    }

    pub(crate) fn dead_execution_handler(&self) -> &Arc<dyn DeadExecutionHandler> {
        &self.dead_execution_handler
    }

    /// A payload-free instance of this task.
    pub fn instance(&self, instance_id: impl Into<String>) -> TaskInstance {
        TaskInstance::new(self.name.clone(), instance_id)
    }

    /// An instance carrying `data`, encoded with this task's serializer.
    pub fn instance_with_data<T: Serialize>(
        &self,
        instance_id: impl Into<String>,
        data: &T,
    ) -> Result<TaskInstance, SchedulerError> {
        let payload = serialize_payload(self.serializer.as_ref(), data)?;
        Ok(TaskInstance::with_payload(
            self.name.clone(),
            instance_id,
            payload,
        ))
    }

    /// Decode an instance's payload with this task's serializer.
    pub fn data<T: DeserializeOwned>(
        &self,
        instance: &TaskInstance,
    ) -> Result<Option<T>, SchedulerError> {
        instance
            .payload
            .as_deref()
            .map(|bytes| deserialize_payload(self.serializer.as_ref(), bytes))
            .transpose()
    }
}
