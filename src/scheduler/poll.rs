//! Background loop bodies: due-poll strategies, dead detection, heartbeats.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::runtime::Runtime;
use tracing::{debug, error, info, trace, warn};

use crate::config::PollStrategy;
use crate::core::{Execution, SchedulerError, StatsEvent};
use crate::scheduler::executor::{dispatch_candidate, submit_picked};
use crate::scheduler::SchedulerInner;
use crate::task::handlers::ExecutionOperations;

/// One due-poll iteration, routed to the configured strategy.
pub(crate) fn execute_due(rt: &Runtime, inner: &Arc<SchedulerInner>) {
    let fused = inner.strategy == PollStrategy::FetchAndLockTogether
        && !inner.fused_unsupported.load(Ordering::Acquire);
    if fused {
        execute_due_fused(rt, inner);
    } else {
        execute_due_separate(rt, inner);
    }
}

/// Fetch an unlocked candidate list, then claim each row individually with
/// the version-checked pick.
fn execute_due_separate(rt: &Runtime, inner: &Arc<SchedulerInner>) {
    if inner.permits.available() == 0 {
        debug!("all executors busy, skipping due poll");
        return;
    }

    let now = inner.clock.now();
    let due = match rt.block_on(inner.store.get_due(now, inner.upper_limit)) {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "fetching due executions failed, retrying next tick");
            inner.stats.register_unexpected_error();
            return;
        }
    };
    trace!(count = due.len(), "found due executions");

    let total = due.len();
    for (index, candidate) in due.into_iter().enumerate() {
        if inner.state.is_shutting_down() {
            info!(
                skipped = total - index,
                "scheduler is shutting down, skipping remaining due executions"
            );
            return;
        }
        match dispatch_candidate(rt, inner, candidate) {
            Ok(_) => {}
            Err(SchedulerError::NoAvailableExecutors) => {
                debug!(
                    skipped = total - index,
                    "no available executors, skipping remaining due executions"
                );
                return;
            }
            Err(SchedulerError::ShuttingDown) => return,
            Err(e) => {
                error!(error = %e, "dispatch failed, aborting poll iteration");
                inner.stats.register_unexpected_error();
                return;
            }
        }
    }
    inner.stats.register(StatsEvent::RanExecuteDue);
}

/// Fetch and claim in one round-trip, then hand every returned row to the
/// workers. Sets the more-in-database flag when the batch came back full so
/// workers can wake the poll early once in-flight work drains.
fn execute_due_fused(rt: &Runtime, inner: &Arc<SchedulerInner>) {
    let now = inner.clock.now();
    let in_flight = inner.currently_processing.lock().len();
    let to_fetch = inner
        .upper_limit
        .saturating_sub(in_flight)
        .min(inner.permits.available());
    if to_fetch == 0 {
        trace!("no capacity to fetch executions");
        return;
    }

    let picked = match rt.block_on(inner.store.pick_due(now, to_fetch)) {
        Ok(picked) => picked,
        Err(SchedulerError::UnsupportedOperation(operation)) => {
            warn!(
                operation,
                "store does not support fused polling, falling back to fetch-and-lock-separately"
            );
            inner.fused_unsupported.store(true, Ordering::Release);
            return execute_due_separate(rt, inner);
        }
        Err(e) => {
            error!(error = %e, "picking due executions failed, retrying next tick");
            inner.stats.register_unexpected_error();
            return;
        }
    };
    trace!(count = picked.len(), "picked due executions");

    inner
        .more_executions_in_database
        .store(picked.len() == to_fetch, Ordering::Release);
    if picked.is_empty() {
        return;
    }

    for execution in picked {
        // The fetch was bounded by available permits and only this thread
        // acquires them, so the acquire cannot fail.
        if !inner.permits.try_acquire() {
            error!(
                execution = %execution.id(),
                "no permit for a row picked by this scheduler, leaving it for dead detection"
            );
            inner.stats.register_unexpected_error();
            continue;
        }
        if submit_picked(inner, execution).is_err() {
            return;
        }
    }
    inner.stats.register(StatsEvent::RanExecuteDue);
}

/// One dead-detection iteration: find picked rows with expired heartbeats
/// and delegate recovery to each task's dead-execution handler.
pub(crate) fn detect_dead(rt: &Runtime, inner: &Arc<SchedulerInner>) {
    debug!("checking for dead executions");
    let now = inner.clock.now();
    let age_limit = now
        - chrono::Duration::from_std(inner.dead_after)
            .unwrap_or_else(|_| chrono::Duration::zero());

    let old = match rt.block_on(inner.store.get_old_executions(age_limit)) {
        Ok(old) => old,
        Err(e) => {
            error!(error = %e, "fetching dead executions failed, retrying next tick");
            inner.stats.register_unexpected_error();
            return;
        }
    };
    if old.is_empty() {
        trace!("no dead executions found");
        inner.stats.register(StatsEvent::RanDetectDead);
        return;
    }

    for execution in old {
        if inner.state.is_shutting_down() {
            return;
        }
        inner.stats.register(StatsEvent::DeadExecutionFound);
        info!(execution = %execution, "found dead execution, delegating handling to task");

        let Some(task) = inner.registry.resolve(execution.task_name()) else {
            error!(
                execution = %execution.id(),
                "no implementation for task of dead execution; either delete the row \
                 or deploy an implementation for it"
            );
            continue;
        };

        let ops = ExecutionOperations::new(Arc::clone(&inner.store), execution.clone(), now);
        let handler = Arc::clone(task.dead_execution_handler());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            rt.block_on(handler.dead_execution(execution.clone(), &ops))
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    execution = %execution.id(),
                    error = %e,
                    "failed handling dead execution, will be tried again later"
                );
                inner.stats.register_unexpected_error();
            }
            Err(_) => {
                error!(
                    execution = %execution.id(),
                    "dead-execution handler panicked, will be tried again later"
                );
                inner.stats.register_unexpected_error();
            }
        }
    }
    inner.stats.register(StatsEvent::RanDetectDead);
}

/// One heartbeat iteration: refresh the liveness stamp of every execution
/// this scheduler is running. The map is snapshotted first so no lock is
/// held during store calls.
pub(crate) fn update_heartbeats(rt: &Runtime, inner: &Arc<SchedulerInner>) {
    let snapshot: Vec<Execution> = {
        let processing = inner.currently_processing.lock();
        processing.values().map(|c| c.execution.clone()).collect()
    };
    if snapshot.is_empty() {
        trace!("no executions to update heartbeats for, skipping");
        return;
    }

    debug!(count = snapshot.len(), "updating heartbeats");
    let now = inner.clock.now();
    for execution in snapshot {
        trace!(execution = %execution.id(), "updating heartbeat");
        if let Err(e) = rt.block_on(inner.store.update_heartbeat(&execution, now)) {
            // A missed heartbeat eventually triggers dead detection on the
            // row, so persistent failure self-corrects into recovery.
            error!(
                execution = %execution.id(),
                error = %e,
                "failed updating heartbeat, will try again later"
            );
            inner.stats.register(StatsEvent::HeartbeatFailed);
            inner.stats.register_unexpected_error();
        }
    }
    inner.stats.register(StatsEvent::RanUpdateHeartbeats);
}
