//! The scheduler: lifecycle, background loops, and the worker pool.
//!
//! Three singleton background threads (due-poll, dead-detection, heartbeat)
//! coordinate through the execution store; a fixed pool of worker threads
//! runs picked executions. Mutual exclusion across schedulers is enforced
//! solely by the store's version-checked pick, never by locks held between
//! database calls.

mod executor;
mod poll;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::client::{
    ClientEvent, ClientEventListener, ClientEventType, NoopClientEventListener, SchedulerClient,
    StandardSchedulerClient,
};
use crate::config::{PollStrategy, SchedulerConfig};
use crate::core::{
    CurrentlyExecuting, Execution, ExecutionId, NoopStatsSink, Permits, ScheduledExecution,
    SchedulerError, StatsSink, TaskInstance, Waiter,
};
use crate::store::ExecutionStore;
use crate::task::registry::TaskRegistry;
use crate::task::{Task, RECURRING_INSTANCE};
use crate::util::{SharedClock, SystemClock};

/// Lifecycle states of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerLifecycle {
    /// Constructed, not yet started.
    Created,
    /// Background loops and workers are running.
    Started,
    /// `stop` was called; loops short-circuit, in-flight work drains.
    ShuttingDown,
    /// Fully stopped.
    Stopped,
}

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Shared lifecycle flag, readable from handlers and background loops.
#[derive(Debug, Default)]
pub struct SchedulerState {
    state: AtomicU8,
}

impl SchedulerState {
    /// Current lifecycle state.
    pub fn lifecycle(&self) -> SchedulerLifecycle {
        match self.state.load(Ordering::Acquire) {
            STATE_STARTED => SchedulerLifecycle::Started,
            STATE_SHUTTING_DOWN => SchedulerLifecycle::ShuttingDown,
            STATE_STOPPED => SchedulerLifecycle::Stopped,
            _ => SchedulerLifecycle::Created,
        }
    }

    /// Whether the scheduler is running.
    pub fn is_started(&self) -> bool {
        self.lifecycle() == SchedulerLifecycle::Started
    }

    /// Whether shutdown was requested or completed.
    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.lifecycle(),
            SchedulerLifecycle::ShuttingDown | SchedulerLifecycle::Stopped
        )
    }

    fn try_transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_stopped(&self) {
        self.state.store(STATE_STOPPED, Ordering::Release);
    }
}

/// Context handed to execution handlers.
pub struct ExecutionContext {
    execution: Execution,
    state: Arc<SchedulerState>,
}

impl ExecutionContext {
    pub(crate) fn new(execution: Execution, state: Arc<SchedulerState>) -> Self {
        Self { execution, state }
    }

    /// The execution being run.
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Whether the owning scheduler is shutting down. Long-running handlers
    /// that want cooperative cancellation poll this; the scheduler itself
    /// never interrupts a running execution.
    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }
}

/// State shared between the background loops and the worker pool.
pub(crate) struct SchedulerInner {
    pub(crate) clock: SharedClock,
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) stats: Arc<dyn StatsSink>,
    pub(crate) state: Arc<SchedulerState>,
    pub(crate) permits: Permits,
    pub(crate) currently_processing: Mutex<HashMap<ExecutionId, CurrentlyExecuting>>,
    /// Signaled whenever an execution finishes; pairs with
    /// `currently_processing` for the shutdown drain.
    pub(crate) idle: Condvar,
    pub(crate) due_waiter: Arc<Waiter>,
    pub(crate) detect_dead_waiter: Arc<Waiter>,
    pub(crate) heartbeat_waiter: Arc<Waiter>,
    pub(crate) dead_after: Duration,
    pub(crate) lower_limit: usize,
    pub(crate) upper_limit: usize,
    pub(crate) strategy: PollStrategy,
    /// Latched when the store rejects `pick_due`; polling then permanently
    /// falls back to fetch-and-lock-separately.
    pub(crate) fused_unsupported: AtomicBool,
    /// Set when the last fused fetch returned a full batch. Together with
    /// in-flight dropping to the lower limit, this is the early-repoll
    /// predicate.
    pub(crate) more_executions_in_database: AtomicBool,
    pub(crate) work_tx: Mutex<Option<Sender<Execution>>>,
}

/// A persistent, cluster-safe task scheduler.
///
/// Construct with [`Scheduler::new`], register work through the
/// [`SchedulerClient`] methods, and call [`Scheduler::start`]. Multiple
/// schedulers may share one execution store; each due execution runs on
/// exactly one of them.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    client: StandardSchedulerClient,
    start_tasks: Vec<String>,
    threads: usize,
    shutdown_max_wait: Duration,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// A scheduler over `store` with the given task definitions, using the
    /// system clock and no stats sink.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ExecutionStore>,
        tasks: Vec<Task>,
    ) -> Result<Self, SchedulerError> {
        Self::with_components(
            config,
            store,
            tasks,
            Arc::new(SystemClock),
            Arc::new(NoopStatsSink),
        )
    }

    /// A scheduler with an explicit clock and stats sink.
    pub fn with_components(
        config: SchedulerConfig,
        store: Arc<dyn ExecutionStore>,
        tasks: Vec<Task>,
        clock: SharedClock,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let registry = Arc::new(TaskRegistry::new(tasks));
        let state = Arc::new(SchedulerState::default());
        let due_waiter = Arc::new(Waiter::new(config.polling_interval));
        let detect_dead_waiter = Arc::new(Waiter::new(config.heartbeat_interval * 2));
        let heartbeat_waiter = Arc::new(Waiter::new(config.heartbeat_interval));

        let inner = Arc::new(SchedulerInner {
            clock: Arc::clone(&clock),
            store: Arc::clone(&store),
            registry,
            stats,
            state: Arc::clone(&state),
            permits: Permits::new(config.threads),
            currently_processing: Mutex::new(HashMap::new()),
            idle: Condvar::new(),
            due_waiter: Arc::clone(&due_waiter),
            detect_dead_waiter,
            heartbeat_waiter,
            dead_after: config.dead_after(),
            lower_limit: config.poll_strategy.lower_limit(config.threads),
            upper_limit: config.poll_strategy.upper_limit(config.threads),
            strategy: config.poll_strategy.strategy,
            fused_unsupported: AtomicBool::new(false),
            more_executions_in_database: AtomicBool::new(false),
            work_tx: Mutex::new(None),
        });

        let listener: Arc<dyn ClientEventListener> = if config.enable_immediate_execution {
            Arc::new(TriggerCheckForDueExecutions {
                state,
                clock,
                due_waiter,
            })
        } else {
            Arc::new(NoopClientEventListener)
        };
        let client = StandardSchedulerClient::new(store, listener);

        Ok(Self {
            inner,
            client,
            start_tasks: config.start_tasks,
            threads: config.threads,
            shutdown_max_wait: config.shutdown_max_wait,
            loop_handles: Mutex::new(Vec::new()),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> SchedulerLifecycle {
        self.inner.state.lifecycle()
    }

    /// Start the background loops and the worker pool. Idempotent: a second
    /// call warns and does nothing.
    pub fn start(&self) {
        if !self
            .inner
            .state
            .try_transition(STATE_CREATED, STATE_STARTED)
        {
            warn!("multiple calls to start(), scheduler is already started");
            return;
        }
        info!("starting scheduler");

        let (work_tx, work_rx) = bounded::<Execution>(self.threads);
        *self.inner.work_tx.lock() = Some(work_tx);

        let mut workers = self.worker_handles.lock();
        for worker_id in 0..self.threads {
            workers.push(executor::spawn_worker(
                worker_id,
                work_rx.clone(),
                Arc::clone(&self.inner),
            ));
        }
        drop(workers);

        let start_tasks = self.start_tasks.clone();
        let startup = Once::new();
        let mut loops = self.loop_handles.lock();
        loops.push(run_until_shutdown(
            "execute-due",
            Arc::clone(&self.inner),
            Arc::clone(&self.inner.due_waiter),
            move |rt, inner| {
                startup.call_once(|| execute_on_startup(rt, inner, &start_tasks));
                poll::execute_due(rt, inner);
            },
        ));
        loops.push(run_until_shutdown(
            "detect-dead",
            Arc::clone(&self.inner),
            Arc::clone(&self.inner.detect_dead_waiter),
            poll::detect_dead,
        ));
        loops.push(run_until_shutdown(
            "update-heartbeat",
            Arc::clone(&self.inner),
            Arc::clone(&self.inner.heartbeat_waiter),
            poll::update_heartbeats,
        ));
    }

    /// Stop the scheduler: background loops exit, in-flight executions get
    /// the configured grace period, and anything unfinished is left for peer
    /// recovery via dead detection. Idempotent: a second call warns and does
    /// nothing.
    pub fn stop(&self) {
        let from_started = self
            .inner
            .state
            .try_transition(STATE_STARTED, STATE_SHUTTING_DOWN);
        let from_created = !from_started
            && self
                .inner
                .state
                .try_transition(STATE_CREATED, STATE_SHUTTING_DOWN);
        if !from_started && !from_created {
            warn!("multiple calls to stop(), scheduler is already stopping");
            return;
        }

        info!("shutting down scheduler");
        self.inner.due_waiter.wake();
        self.inner.detect_dead_waiter.wake();
        self.inner.heartbeat_waiter.wake();

        for handle in self.loop_handles.lock().drain(..) {
            join_with_timeout(handle, Duration::from_secs(5), "background loop");
        }

        // Closing the channel unblocks idle workers; busy ones finish their
        // current execution first.
        *self.inner.work_tx.lock() = None;

        info!(
            wait_secs = self.shutdown_max_wait.as_secs(),
            "letting running executions finish"
        );
        let deadline = Instant::now() + self.shutdown_max_wait;
        let drained = {
            let mut processing = self.inner.currently_processing.lock();
            while !processing.is_empty() {
                if self
                    .inner
                    .idle
                    .wait_until(&mut processing, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if processing.is_empty() {
                true
            } else {
                let remaining: Vec<String> =
                    processing.keys().map(ToString::to_string).collect();
                warn!(
                    remaining = remaining.len(),
                    executions = ?remaining,
                    "scheduler stopping with unfinished executions; they will be \
                     recovered by a peer once their heartbeat expires"
                );
                false
            }
        };

        let mut workers = self.worker_handles.lock();
        if drained {
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    warn!("worker panicked during shutdown");
                }
            }
        } else {
            // Abandon workers still running a handler; their threads exit
            // once the handler returns.
            workers.clear();
        }
        drop(workers);

        self.inner.state.set_stopped();
        info!("scheduler stopped");
    }

    /// Wake the due-poll loop to run ahead of its next tick.
    pub fn trigger_check_for_due_executions(&self) {
        self.inner.due_waiter.wake();
    }

    /// Executions currently running on this scheduler.
    pub fn currently_executing(&self) -> Vec<CurrentlyExecuting> {
        self.inner
            .currently_processing
            .lock()
            .values()
            .cloned()
            .collect()
    }

    /// Unpicked executions that keep failing and have not succeeded for at
    /// least `failing_for`.
    pub async fn get_failing_executions(
        &self,
        failing_for: Duration,
    ) -> Result<Vec<Execution>, SchedulerError> {
        self.inner
            .store
            .get_executions_failing_longer_than(self.inner.clock.now(), failing_for)
            .await
    }
}

#[async_trait]
impl SchedulerClient for Scheduler {
    async fn schedule(
        &self,
        instance: TaskInstance,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        self.client.schedule(instance, execution_time).await
    }

    async fn reschedule(
        &self,
        id: &ExecutionId,
        new_execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        self.client.reschedule(id, new_execution_time).await
    }

    async fn cancel(&self, id: &ExecutionId) -> Result<bool, SchedulerError> {
        self.client.cancel(id).await
    }

    async fn get_scheduled_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ScheduledExecution>, SchedulerError> {
        self.client.get_scheduled_execution(id).await
    }

    async fn get_scheduled_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<ScheduledExecution>, SchedulerError> {
        self.client.get_scheduled_executions_for_task(task_name).await
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal shutdown but do not wait for workers; an explicit stop() is
        // required for a graceful drain.
        if self.inner.state.is_started() {
            debug!("scheduler dropped without explicit stop(), abandoning background threads");
            let _ = self
                .inner
                .state
                .try_transition(STATE_STARTED, STATE_SHUTTING_DOWN);
            self.inner.due_waiter.wake();
            self.inner.detect_dead_waiter.wake();
            self.inner.heartbeat_waiter.wake();
            *self.inner.work_tx.lock() = None;
        }
    }
}

/// Auto-insert the rows of configured recurring tasks, once, before the
/// first poll.
fn execute_on_startup(
    rt: &tokio::runtime::Runtime,
    inner: &Arc<SchedulerInner>,
    start_tasks: &[String],
) {
    for name in start_tasks {
        let task = match inner.registry.resolve_required(name) {
            Ok(task) => task,
            Err(e) => {
                error!(task = %name, error = %e, "skipping auto-insert of start task");
                inner.stats.register_unexpected_error();
                continue;
            }
        };
        let Some(schedule) = task.schedule() else {
            warn!(task = %name, "start task has no schedule, skipping auto-insert");
            continue;
        };
        let now = inner.clock.now();
        let execution = Execution::new(
            task.instance(RECURRING_INSTANCE),
            schedule.next_execution_time(now),
        );
        match rt.block_on(inner.store.create_if_not_exists(&execution)) {
            Ok(true) => info!(task = %name, "scheduled recurring task on startup"),
            Ok(false) => debug!(task = %name, "recurring task already scheduled"),
            Err(e) => {
                error!(task = %name, error = %e, "failed scheduling start task, continuing");
                inner.stats.register_unexpected_error();
            }
        }
    }
}

/// Run `body` on a dedicated named thread until shutdown is observed,
/// sleeping on `waiter` between iterations. Panics are caught, counted, and
/// the loop keeps running; only the shutdown flag stops it.
fn run_until_shutdown<F>(
    name: &'static str,
    inner: Arc<SchedulerInner>,
    waiter: Arc<Waiter>,
    body: F,
) -> JoinHandle<()>
where
    F: Fn(&tokio::runtime::Runtime, &Arc<SchedulerInner>) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("taskloom-{name}"))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(thread = name, error = %e, "failed to create loop runtime");
                    return;
                }
            };

            while !inner.state.is_shutting_down() {
                if catch_unwind(AssertUnwindSafe(|| body(&rt, &inner))).is_err() {
                    error!(thread = name, "unhandled panic in background loop, will keep running");
                    inner.stats.register_unexpected_error();
                }
                waiter.do_wait();
            }
            debug!(thread = name, "background loop exiting");
        })
        .expect("failed to spawn background thread")
}

/// Join `handle` from a helper thread so a stuck loop cannot hang shutdown.
/// A thread that misses the deadline is detached with a warning.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration, what: &'static str) {
    let (tx, rx) = std::sync::mpsc::channel();
    let join_thread = thread::spawn(move || {
        let joined = handle.join().is_ok();
        let _ = tx.send(joined);
    });
    match rx.recv_timeout(timeout) {
        Ok(true) => {}
        Ok(false) => warn!(what, "thread panicked during shutdown"),
        Err(_) => {
            warn!(what, "thread did not exit within the timeout, detaching");
            return;
        }
    }
    let _ = join_thread.join();
}

/// Listener that wakes the due-poll loop when a client schedules work that
/// is already due, so it starts without waiting for the next tick.
struct TriggerCheckForDueExecutions {
    state: Arc<SchedulerState>,
    clock: SharedClock,
    due_waiter: Arc<Waiter>,
}

impl ClientEventListener for TriggerCheckForDueExecutions {
    fn new_event(&self, event: &ClientEvent) {
        if !self.state.is_started() || self.state.is_shutting_down() {
            debug!(
                execution = %event.instance,
                "ignoring scheduling event, scheduler is starting or shutting down"
            );
            return;
        }
        if !matches!(
            event.event_type,
            ClientEventType::Schedule | ClientEventType::Reschedule
        ) {
            return;
        }
        if let Some(execution_time) = event.execution_time {
            if execution_time <= self.clock.now() {
                info!(
                    execution = %event.instance,
                    "scheduled to run directly, triggering check for due executions"
                );
                self.due_waiter.wake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_are_one_way() {
        let state = SchedulerState::default();
        assert_eq!(state.lifecycle(), SchedulerLifecycle::Created);
        assert!(state.try_transition(STATE_CREATED, STATE_STARTED));
        assert!(!state.try_transition(STATE_CREATED, STATE_STARTED));
        assert!(state.is_started());

        assert!(state.try_transition(STATE_STARTED, STATE_SHUTTING_DOWN));
        assert!(state.is_shutting_down());
        assert!(!state.is_started());

        state.set_stopped();
        assert_eq!(state.lifecycle(), SchedulerLifecycle::Stopped);
        assert!(state.is_shutting_down());
    }
}
