//! Worker pool and per-execution run routine.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tokio::runtime::Runtime;
use tracing::{debug, error, warn};

use crate::core::{
    CurrentlyExecuting, Execution, ExecutionComplete, SchedulerError, StatsEvent,
};
use crate::scheduler::{ExecutionContext, SchedulerInner};
use crate::task::handlers::ExecutionOperations;

/// Result of offering one due candidate to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Picked and handed to a worker.
    Submitted,
    /// A peer scheduler won the pick race.
    TakenByPeer,
}

/// Acquire a permit, claim the candidate, and hand it to a worker.
///
/// The permit is held for the entire lifetime of the execution; every path
/// that fails after acquiring releases it before returning.
pub(crate) fn dispatch_candidate(
    rt: &Runtime,
    inner: &Arc<SchedulerInner>,
    candidate: Execution,
) -> Result<DispatchOutcome, SchedulerError> {
    if !inner.permits.try_acquire() {
        return Err(SchedulerError::NoAvailableExecutors);
    }

    let picked = match rt.block_on(inner.store.pick(&candidate, inner.clock.now())) {
        Ok(picked) => picked,
        Err(e) => {
            inner.permits.release();
            return Err(e);
        }
    };
    let Some(picked) = picked else {
        inner.permits.release();
        debug!(execution = %candidate.id(), "execution picked by another scheduler");
        return Ok(DispatchOutcome::TakenByPeer);
    };

    submit_picked(inner, picked)?;
    Ok(DispatchOutcome::Submitted)
}

/// Hand an already-picked execution to the worker pool. The caller must hold
/// a permit for it.
pub(crate) fn submit_picked(
    inner: &Arc<SchedulerInner>,
    picked: Execution,
) -> Result<(), SchedulerError> {
    let id = picked.id();
    inner.currently_processing.lock().insert(
        id.clone(),
        CurrentlyExecuting {
            execution: picked.clone(),
            picked_at: inner.clock.now(),
        },
    );

    let send_result = {
        let tx_guard = inner.work_tx.lock();
        match tx_guard.as_ref() {
            Some(tx) => tx.send(picked).map_err(|_| ()),
            None => Err(()),
        }
    };
    if send_result.is_err() {
        // Shutdown raced the submit. The row stays picked; a peer recovers
        // it once the heartbeat expires.
        inner.currently_processing.lock().remove(&id);
        inner.permits.release();
        inner.idle.notify_all();
        warn!(execution = %id, "worker pool closed before submit, leaving row for peer recovery");
        return Err(SchedulerError::ShuttingDown);
    }
    Ok(())
}

/// Spawn one worker thread. Each worker owns a single-threaded tokio runtime
/// and blocks on the channel until it is closed.
pub(crate) fn spawn_worker(
    worker_id: usize,
    work_rx: Receiver<Execution>,
    inner: Arc<SchedulerInner>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("taskloom-worker-{worker_id}"))
        .spawn(move || {
            debug!(worker_id, "worker thread started");
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                    return;
                }
            };

            // Blocks until work arrives; a closed channel ends the worker.
            while let Ok(execution) = work_rx.recv() {
                let id = execution.id();
                run_picked(&rt, &inner, execution);
                finish_execution(&inner, &id);
            }
            debug!(worker_id, "worker channel closed, exiting");
        })
        .expect("failed to spawn worker thread")
}

/// Run one picked execution: handler, then completion or failure policy.
///
/// Handler panics are treated as failures. Errors from the completion and
/// failure policies themselves are logged and counted; the row then stays
/// picked until dead detection recovers it.
fn run_picked(rt: &Runtime, inner: &Arc<SchedulerInner>, execution: Execution) {
    let Some(task) = inner.registry.resolve(execution.task_name()) else {
        error!(
            execution = %execution.id(),
            "no implementation for task of picked execution; the row stays picked \
             until dead detection recovers it"
        );
        return;
    };

    debug!(execution = %execution.id(), "executing");
    let ctx = ExecutionContext::new(execution.clone(), Arc::clone(&inner.state));
    let instance = execution.task_instance.clone();
    let handler = Arc::clone(task.handler());
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        rt.block_on(handler.execute(&instance, &ctx))
    }));

    let time_done = inner.clock.now();
    let ops = ExecutionOperations::new(Arc::clone(&inner.store), execution.clone(), time_done);
    match outcome {
        Ok(Ok(())) => {
            debug!(execution = %execution.id(), "execution done");
            inner.stats.register(StatsEvent::ExecutionCompleted);
            let complete = ExecutionComplete::success(execution.clone(), time_done);
            let completion = Arc::clone(task.completion_handler());
            let result = catch_unwind(AssertUnwindSafe(|| {
                rt.block_on(completion.complete(complete, &ops))
            }));
            handle_post_run_result(inner, &execution, result, "completion");
        }
        Ok(Err(cause)) => {
            warn!(
                execution = %execution.id(),
                error = %cause,
                "unhandled error during execution, treating as failure"
            );
            inner.stats.register(StatsEvent::ExecutionFailed);
            let complete = ExecutionComplete::failure(execution.clone(), time_done, cause);
            let failure = Arc::clone(task.failure_handler());
            let result = catch_unwind(AssertUnwindSafe(|| {
                rt.block_on(failure.on_failure(complete, &ops))
            }));
            handle_post_run_result(inner, &execution, result, "failure");
        }
        Err(panic) => {
            let cause = anyhow::anyhow!("execution handler panicked: {}", panic_message(&panic));
            error!(execution = %execution.id(), error = %cause, "panic during execution, treating as failure");
            inner.stats.register(StatsEvent::ExecutionFailed);
            let complete = ExecutionComplete::failure(execution.clone(), time_done, cause);
            let failure = Arc::clone(task.failure_handler());
            let result = catch_unwind(AssertUnwindSafe(|| {
                rt.block_on(failure.on_failure(complete, &ops))
            }));
            handle_post_run_result(inner, &execution, result, "failure");
        }
    }
}

fn handle_post_run_result(
    inner: &Arc<SchedulerInner>,
    execution: &Execution,
    result: std::thread::Result<anyhow::Result<()>>,
    handler_kind: &'static str,
) {
    let failed = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("panicked: {}", panic_message(&panic))),
    };
    if let Some(cause) = failed {
        inner.stats.register(StatsEvent::CompletionHandlerFailed);
        inner.stats.register_unexpected_error();
        error!(
            execution = %execution.id(),
            handler = handler_kind,
            cause = %cause,
            dead_after_secs = inner.dead_after.as_secs(),
            "post-run handler failed; the execution likely remains picked and \
             will be recovered by dead detection"
        );
    }
}

/// Remove a finished execution from the processing map, return its permit,
/// and wake the poll loop when the fused strategy left more work behind.
fn finish_execution(inner: &Arc<SchedulerInner>, id: &crate::core::ExecutionId) {
    let in_flight = {
        let mut processing = inner.currently_processing.lock();
        if processing.remove(id).is_none() {
            error!(
                execution = %id,
                "finished execution was not in the currently-processing map"
            );
            inner.stats.register_unexpected_error();
        }
        inner.permits.release();
        inner.idle.notify_all();
        processing.len()
    };

    if inner.more_executions_in_database.load(Ordering::Acquire)
        && in_flight <= inner.lower_limit
    {
        inner.due_waiter.wake();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
