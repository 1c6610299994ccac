//! Task instances and persisted execution rows.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Identity of a concrete scheduled invocation.
///
/// The pair `(task_name, instance_id)` is globally unique at rest: at most one
/// row exists per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionId {
    /// Name of the registered task.
    pub task_name: String,
    /// Caller-chosen instance discriminator.
    pub instance_id: String,
}

impl ExecutionId {
    /// Build an identity from its two parts.
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_name, self.instance_id)
    }
}

/// A concrete invocation of a named task, with optional payload bytes.
///
/// The payload is opaque to the scheduler; only the owning task interprets it
/// through its serializer.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    /// Name of the registered task.
    pub task_name: String,
    /// Caller-chosen instance discriminator.
    pub instance_id: String,
    /// Serialized payload, if the task carries data.
    pub payload: Option<Vec<u8>>,
}

impl TaskInstance {
    /// A payload-free instance.
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
            payload: None,
        }
    }

    /// An instance carrying already-serialized payload bytes.
    pub fn with_payload(
        task_name: impl Into<String>,
        instance_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
            payload: Some(payload),
        }
    }

    /// The identity of this instance.
    pub fn id(&self) -> ExecutionId {
        ExecutionId::new(self.task_name.clone(), self.instance_id.clone())
    }
}

/// The persisted row for a task instance plus its runtime state.
///
/// Every mutation increments `version`; conditional updates predicate on the
/// observed version, which makes the pick protocol race-free across
/// schedulers without holding database locks between calls.
#[derive(Debug, Clone)]
pub struct Execution {
    /// The scheduled invocation this row belongs to.
    pub task_instance: TaskInstance,
    /// Next time at which this execution is due. Authoritative only while the
    /// row is unpicked.
    pub execution_time: DateTime<Utc>,
    /// Lock flag: `true` while exactly one scheduler owns the row.
    pub picked: bool,
    /// Scheduler-name of the current owner; `None` when unpicked.
    pub picked_by: Option<String>,
    /// Liveness stamp refreshed by the owner; meaningful only while picked.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Time of the most recent successful completion.
    pub last_success: Option<DateTime<Utc>>,
    /// Time of the most recent failure.
    pub last_failure: Option<DateTime<Utc>>,
    /// Failures since the last success; reset to zero on success.
    pub consecutive_failures: u32,
    /// Optimistic-concurrency counter, strictly increasing across the row's
    /// lifetime.
    pub version: i64,
}

impl Execution {
    /// A fresh, unpicked execution due at `execution_time`.
    pub fn new(task_instance: TaskInstance, execution_time: DateTime<Utc>) -> Self {
        Self {
            task_instance,
            execution_time,
            picked: false,
            picked_by: None,
            last_heartbeat: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            version: 1,
        }
    }

    /// The identity of this execution.
    pub fn id(&self) -> ExecutionId {
        self.task_instance.id()
    }

    /// Task name shorthand.
    pub fn task_name(&self) -> &str {
        &self.task_instance.task_name
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} due {} (picked: {}, version: {})",
            self.id(),
            self.execution_time,
            self.picked,
            self.version
        )
    }
}

/// Client-facing read view of a scheduled execution.
#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    /// The scheduled invocation, including its stored payload bytes.
    pub task_instance: TaskInstance,
    /// Next due time.
    pub execution_time: DateTime<Utc>,
    /// Whether some scheduler currently owns the row.
    pub picked: bool,
}

impl From<Execution> for ScheduledExecution {
    fn from(execution: Execution) -> Self {
        Self {
            task_instance: execution.task_instance,
            execution_time: execution.execution_time,
            picked: execution.picked,
        }
    }
}

/// How a finished execution ended.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The handler returned without error.
    Success,
    /// The handler returned an error or panicked.
    Failure {
        /// Root cause, shared so the outcome stays cloneable.
        cause: Arc<anyhow::Error>,
    },
}

/// Outcome of one run, handed to completion and failure handlers.
#[derive(Debug, Clone)]
pub struct ExecutionComplete {
    /// The execution as it was when picked.
    pub execution: Execution,
    /// Instant the run finished.
    pub time_done: DateTime<Utc>,
    /// Success or failure.
    pub outcome: ExecutionOutcome,
}

impl ExecutionComplete {
    /// A successful completion at `time_done`.
    pub fn success(execution: Execution, time_done: DateTime<Utc>) -> Self {
        Self {
            execution,
            time_done,
            outcome: ExecutionOutcome::Success,
        }
    }

    /// A failed completion at `time_done` with a cause.
    pub fn failure(execution: Execution, time_done: DateTime<Utc>, cause: anyhow::Error) -> Self {
        Self {
            execution,
            time_done,
            outcome: ExecutionOutcome::Failure {
                cause: Arc::new(cause),
            },
        }
    }

    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Success)
    }
}

/// Diagnostic view of an in-flight execution on this scheduler.
#[derive(Debug, Clone)]
pub struct CurrentlyExecuting {
    /// The picked execution.
    pub execution: Execution,
    /// When this scheduler picked it.
    pub picked_at: DateTime<Utc>,
}

impl CurrentlyExecuting {
    /// Wall time this execution has been running as of `now`.
    pub fn duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.picked_at
    }
}
