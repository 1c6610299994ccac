//! Scheduler statistics sinks.
//!
//! The core notifies a [`StatsSink`] about loop iterations, execution
//! outcomes, and swallowed errors. Sinks must be cheap and infallible; the
//! scheduler never acts on their result.

use std::sync::atomic::{AtomicU64, Ordering};

/// Closed set of events the scheduler core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsEvent {
    /// One due-poll iteration ran to completion.
    RanExecuteDue,
    /// One dead-execution-detection iteration ran to completion.
    RanDetectDead,
    /// One heartbeat-update iteration ran to completion.
    RanUpdateHeartbeats,
    /// An execution handler returned successfully.
    ExecutionCompleted,
    /// An execution handler returned an error or panicked.
    ExecutionFailed,
    /// A picked row with an expired heartbeat was found.
    DeadExecutionFound,
    /// A completion or failure handler itself failed after the run.
    CompletionHandlerFailed,
    /// A heartbeat update could not be persisted.
    HeartbeatFailed,
    /// An unexpected error was caught at a loop boundary.
    UnexpectedError,
}

/// Sink for scheduler events.
pub trait StatsSink: Send + Sync {
    /// Record one event occurrence.
    fn register(&self, event: StatsEvent);

    /// Shorthand for the unexpected-error counter.
    fn register_unexpected_error(&self) {
        self.register(StatsEvent::UnexpectedError);
    }
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn register(&self, _event: StatsEvent) {}
}

/// Lock-free counting sink backed by atomics.
#[derive(Debug, Default)]
pub struct AtomicStatsSink {
    ran_execute_due: AtomicU64,
    ran_detect_dead: AtomicU64,
    ran_update_heartbeats: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
    dead_executions_found: AtomicU64,
    completion_handler_failures: AtomicU64,
    heartbeat_failures: AtomicU64,
    unexpected_errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Completed due-poll iterations.
    pub ran_execute_due: u64,
    /// Completed dead-detection iterations.
    pub ran_detect_dead: u64,
    /// Completed heartbeat iterations.
    pub ran_update_heartbeats: u64,
    /// Successful executions.
    pub executions_completed: u64,
    /// Failed executions.
    pub executions_failed: u64,
    /// Dead executions found.
    pub dead_executions_found: u64,
    /// Post-run handler failures.
    pub completion_handler_failures: u64,
    /// Heartbeat persistence failures.
    pub heartbeat_failures: u64,
    /// Errors swallowed at loop boundaries.
    pub unexpected_errors: u64,
}

impl AtomicStatsSink {
    /// A sink with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ran_execute_due: self.ran_execute_due.load(Ordering::Relaxed),
            ran_detect_dead: self.ran_detect_dead.load(Ordering::Relaxed),
            ran_update_heartbeats: self.ran_update_heartbeats.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            dead_executions_found: self.dead_executions_found.load(Ordering::Relaxed),
            completion_handler_failures: self.completion_handler_failures.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            unexpected_errors: self.unexpected_errors.load(Ordering::Relaxed),
        }
    }
}

impl StatsSink for AtomicStatsSink {
    fn register(&self, event: StatsEvent) {
        let counter = match event {
            StatsEvent::RanExecuteDue => &self.ran_execute_due,
            StatsEvent::RanDetectDead => &self.ran_detect_dead,
            StatsEvent::RanUpdateHeartbeats => &self.ran_update_heartbeats,
            StatsEvent::ExecutionCompleted => &self.executions_completed,
            StatsEvent::ExecutionFailed => &self.executions_failed,
            StatsEvent::DeadExecutionFound => &self.dead_executions_found,
            StatsEvent::CompletionHandlerFailed => &self.completion_handler_failures,
            StatsEvent::HeartbeatFailed => &self.heartbeat_failures,
            StatsEvent::UnexpectedError => &self.unexpected_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
