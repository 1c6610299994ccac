//! End-to-end scheduler tests against the in-memory execution store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use taskloom::{
    AtomicStatsSink, ExecutionId, ExecutionStore, FixedDelay, FnHandler, InMemoryExecutionStore,
    PollStrategy, PollStrategyConfig, Scheduler, SchedulerClient, SchedulerConfig,
    SchedulerLifecycle, SystemClock, Task, TaskInstance, RECURRING_INSTANCE,
};

fn fast_config(name: &str) -> SchedulerConfig {
    SchedulerConfig::new()
        .with_scheduler_name(name)
        .with_threads(4)
        .with_polling_interval(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_secs(60))
        .with_shutdown_max_wait(Duration::from_secs(10))
}

/// Poll `predicate` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

fn counting_task(name: &str, counter: Arc<AtomicUsize>) -> Task {
    Task::one_time(
        name,
        Arc::new(FnHandler(move |_instance: &TaskInstance, _ctx: &taskloom::ExecutionContext| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn one_time_execution_runs_once_and_removes_the_row() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let runs = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(
        fast_config("s1"),
        store.clone(),
        vec![counting_task("ot", runs.clone())],
    )
    .unwrap();

    scheduler
        .schedule(
            TaskInstance::new("ot", "1"),
            Utc::now() + chrono::Duration::milliseconds(200),
        )
        .await
        .unwrap();
    scheduler.start();

    assert!(wait_until(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) == 1 && store.is_empty()
    }));
    // One more poll tick: the handler must not run again.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    scheduler.stop();
    assert_eq!(scheduler.lifecycle(), SchedulerLifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_execution_beats_the_poll_tick() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let runs = Arc::new(AtomicUsize::new(0));
    // A one-minute tick: only the waker can start this work quickly.
    let config = fast_config("s1")
        .with_polling_interval(Duration::from_secs(60))
        .enable_immediate_execution();
    let scheduler = Scheduler::new(
        config,
        store.clone(),
        vec![counting_task("ot", runs.clone())],
    )
    .unwrap();

    scheduler.start();
    // Let the initial (empty) poll pass.
    std::thread::sleep(Duration::from_millis(100));

    scheduler
        .schedule(
            TaskInstance::new("ot", "2"),
            Utc::now() - chrono::Duration::milliseconds(1),
        )
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    scheduler.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_start_task_is_inserted_once_across_two_schedulers() {
    let store_a = Arc::new(InMemoryExecutionStore::new("a"));
    let store_b = Arc::new(store_a.shared_with_name("b"));
    let runs = Arc::new(AtomicUsize::new(0));

    let hourly = |counter: Arc<AtomicUsize>| {
        Task::recurring(
            "hr",
            Arc::new(FixedDelay::of(Duration::from_secs(3600))),
            Arc::new(FnHandler(move |_instance: &TaskInstance, _ctx: &taskloom::ExecutionContext| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        )
    };

    let config = |name: &str| fast_config(name).with_start_tasks(vec!["hr".into()]);
    let scheduler_a =
        Scheduler::new(config("a"), store_a.clone(), vec![hourly(runs.clone())]).unwrap();
    let scheduler_b =
        Scheduler::new(config("b"), store_b.clone(), vec![hourly(runs.clone())]).unwrap();

    scheduler_a.start();
    scheduler_b.start();

    assert!(wait_until(Duration::from_secs(2), || store_a.len() == 1));
    std::thread::sleep(Duration::from_millis(300));

    // Exactly one row, due an hour out, not yet run by either scheduler.
    assert_eq!(store_a.len(), 1);
    let row = store_a
        .get_execution("hr", RECURRING_INSTANCE)
        .await
        .unwrap()
        .unwrap();
    assert!(row.execution_time > Utc::now() + chrono::Duration::minutes(55));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    scheduler_a.stop();
    scheduler_b.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_reschedules_with_incremented_counter() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_task = attempts.clone();
    let flaky = Task::one_time(
        "flaky",
        Arc::new(FnHandler(move |_instance: &TaskInstance, _ctx: &taskloom::ExecutionContext| -> anyhow::Result<()> {
            attempts_in_task.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("downstream unavailable"))
        })),
    )
    .with_failure_handler(Arc::new(taskloom::OnFailureRetryLater::new(
        Duration::from_millis(500),
    )));

    let scheduler = Scheduler::new(fast_config("s1"), store.clone(), vec![flaky]).unwrap();
    scheduler
        .schedule(TaskInstance::new("flaky", "1"), Utc::now())
        .await
        .unwrap();
    scheduler.start();

    assert!(wait_until(Duration::from_secs(5), || {
        attempts.load(Ordering::SeqCst) >= 1
    }));
    // Let the failure handler release the row.
    assert!(wait_until(Duration::from_secs(5), || {
        store
            .rows_snapshot()
            .first()
            .map(|row| !row.picked && row.consecutive_failures == 1)
            .unwrap_or(false)
    }));

    let row = store.get_execution("flaky", "1").await.unwrap().unwrap();
    let failed_at = row.last_failure.expect("failure stamp set");
    assert_eq!(
        row.execution_time,
        failed_at + chrono::Duration::milliseconds(500)
    );

    // The retry happens roughly half a second later and fails again.
    assert!(wait_until(Duration::from_secs(5), || {
        attempts.load(Ordering::SeqCst) >= 2
    }));
    scheduler.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_execution_is_recovered_by_a_peer() {
    let store_a = Arc::new(InMemoryExecutionStore::new("a"));
    let store_b = Arc::new(store_a.shared_with_name("b"));
    let runs = Arc::new(AtomicUsize::new(0));

    // Scheduler A picked the row and then died: the heartbeat is stale.
    let execution = taskloom::Execution::new(TaskInstance::new("ot", "1"), Utc::now());
    store_a.create_if_not_exists(&execution).await.unwrap();
    store_a
        .pick(&execution, Utc::now() - chrono::Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();

    // Scheduler B considers rows dead after 4x a one-second heartbeat.
    let config = fast_config("b").with_heartbeat_interval(Duration::from_secs(1));
    let scheduler_b = Scheduler::new(
        config,
        store_b.clone(),
        vec![counting_task("ot", runs.clone())],
    )
    .unwrap();
    scheduler_b.start();

    // Recovery clears the pick and sets the due time to now; the next poll
    // runs it and the one-time completion removes the row.
    assert!(wait_until(Duration::from_secs(10), || {
        runs.load(Ordering::SeqCst) == 1 && store_a.is_empty()
    }));
    scheduler_b.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn parallelism_is_bounded_by_the_thread_count() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let current_in_task = current.clone();
    let peak_in_task = peak.clone();
    let done_in_task = done.clone();
    let slow = Task::one_time(
        "slow",
        Arc::new(FnHandler(move |_instance: &TaskInstance, _ctx: &taskloom::ExecutionContext| -> anyhow::Result<()> {
            let running = current_in_task.fetch_add(1, Ordering::SeqCst) + 1;
            peak_in_task.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            current_in_task.fetch_sub(1, Ordering::SeqCst);
            done_in_task.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })),
    );

    let config = fast_config("s1").with_threads(2);
    let scheduler = Scheduler::new(config, store.clone(), vec![slow]).unwrap();
    for i in 0..3 {
        scheduler
            .schedule(TaskInstance::new("slow", i.to_string()), Utc::now())
            .await
            .unwrap();
    }
    scheduler.start();

    assert!(wait_until(Duration::from_secs(10), || {
        done.load(Ordering::SeqCst) == 3
    }));
    assert!(peak.load(Ordering::SeqCst) <= 2);

    scheduler.stop();
    assert!(scheduler.currently_executing().is_empty());
    assert!(store.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn fused_polling_runs_everything_on_capable_stores() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let runs = Arc::new(AtomicUsize::new(0));
    let config = fast_config("s1").with_poll_strategy(PollStrategyConfig {
        strategy: PollStrategy::FetchAndLockTogether,
        lower_limit_fraction: 0.5,
        upper_limit_fraction: 1.0,
    });
    let scheduler = Scheduler::new(
        config,
        store.clone(),
        vec![counting_task("ot", runs.clone())],
    )
    .unwrap();

    for i in 0..6 {
        scheduler
            .schedule(TaskInstance::new("ot", i.to_string()), Utc::now())
            .await
            .unwrap();
    }
    scheduler.start();

    assert!(wait_until(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) == 6 && store.is_empty()
    }));
    scheduler.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn fused_polling_falls_back_when_unsupported() {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc as ChronoUtc};
    use taskloom::{Execution, SchedulerError};

    /// Store without a fused pick; exercises the runtime fallback.
    struct NoFusedStore(InMemoryExecutionStore);

    #[async_trait]
    impl ExecutionStore for NoFusedStore {
        async fn create_if_not_exists(&self, e: &Execution) -> Result<bool, SchedulerError> {
            self.0.create_if_not_exists(e).await
        }
        async fn get_due(
            &self,
            now: DateTime<ChronoUtc>,
            limit: usize,
        ) -> Result<Vec<Execution>, SchedulerError> {
            self.0.get_due(now, limit).await
        }
        async fn pick(
            &self,
            e: &Execution,
            now: DateTime<ChronoUtc>,
        ) -> Result<Option<Execution>, SchedulerError> {
            self.0.pick(e, now).await
        }
        async fn update_heartbeat(
            &self,
            e: &Execution,
            now: DateTime<ChronoUtc>,
        ) -> Result<(), SchedulerError> {
            self.0.update_heartbeat(e, now).await
        }
        async fn get_old_executions(
            &self,
            older_than: DateTime<ChronoUtc>,
        ) -> Result<Vec<Execution>, SchedulerError> {
            self.0.get_old_executions(older_than).await
        }
        async fn get_executions_failing_longer_than(
            &self,
            now: DateTime<ChronoUtc>,
            duration: Duration,
        ) -> Result<Vec<Execution>, SchedulerError> {
            self.0.get_executions_failing_longer_than(now, duration).await
        }
        async fn reschedule(
            &self,
            e: &Execution,
            next: DateTime<ChronoUtc>,
            new_payload: Option<Vec<u8>>,
            last_success: Option<DateTime<ChronoUtc>>,
            last_failure: Option<DateTime<ChronoUtc>>,
            consecutive_failures: u32,
        ) -> Result<bool, SchedulerError> {
            self.0
                .reschedule(e, next, new_payload, last_success, last_failure, consecutive_failures)
                .await
        }
        async fn remove(&self, e: &Execution) -> Result<bool, SchedulerError> {
            self.0.remove(e).await
        }
        async fn update_payload(
            &self,
            e: &Execution,
            new_payload: Option<Vec<u8>>,
        ) -> Result<bool, SchedulerError> {
            self.0.update_payload(e, new_payload).await
        }
        async fn get_execution(
            &self,
            task_name: &str,
            instance_id: &str,
        ) -> Result<Option<Execution>, SchedulerError> {
            self.0.get_execution(task_name, instance_id).await
        }
        async fn get_executions_for_task(
            &self,
            task_name: &str,
        ) -> Result<Vec<Execution>, SchedulerError> {
            self.0.get_executions_for_task(task_name).await
        }
    }

    let store = Arc::new(NoFusedStore(InMemoryExecutionStore::new("s1")));
    let runs = Arc::new(AtomicUsize::new(0));
    let config = fast_config("s1").with_poll_strategy(PollStrategyConfig {
        strategy: PollStrategy::FetchAndLockTogether,
        lower_limit_fraction: 0.5,
        upper_limit_fraction: 1.0,
    });
    let scheduler = Scheduler::new(
        config,
        store.clone(),
        vec![counting_task("ot", runs.clone())],
    )
    .unwrap();

    scheduler
        .schedule(TaskInstance::new("ot", "1"), Utc::now())
        .await
        .unwrap();
    scheduler.start();

    assert!(wait_until(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    scheduler.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_are_idempotent() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let stats = Arc::new(AtomicStatsSink::new());
    let scheduler = Scheduler::with_components(
        fast_config("s1"),
        store,
        vec![],
        Arc::new(SystemClock),
        stats,
    )
    .unwrap();

    scheduler.start();
    scheduler.start();
    assert_eq!(scheduler.lifecycle(), SchedulerLifecycle::Started);

    scheduler.stop();
    assert_eq!(scheduler.lifecycle(), SchedulerLifecycle::Stopped);
    scheduler.stop();
    assert_eq!(scheduler.lifecycle(), SchedulerLifecycle::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_task_rows_are_left_intact() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let execution =
        taskloom::Execution::new(TaskInstance::new("not-deployed-here", "1"), Utc::now());
    store.create_if_not_exists(&execution).await.unwrap();

    let scheduler = Scheduler::new(fast_config("s1"), store.clone(), vec![]).unwrap();
    scheduler.start();
    std::thread::sleep(Duration::from_millis(300));
    scheduler.stop();

    // The row survived: a later deployment can still handle it.
    assert!(store
        .get_execution("not-deployed-here", "1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_executions_are_listed_for_diagnostics() {
    let store = Arc::new(InMemoryExecutionStore::new("s1"));
    let flaky = Task::one_time(
        "flaky",
        Arc::new(FnHandler(|_: &TaskInstance, _ctx: &taskloom::ExecutionContext| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        })),
    )
    .with_failure_handler(Arc::new(taskloom::OnFailureRetryLater::new(
        Duration::from_secs(3600),
    )));

    let scheduler = Scheduler::new(fast_config("s1"), store.clone(), vec![flaky]).unwrap();
    scheduler
        .schedule(TaskInstance::new("flaky", "1"), Utc::now())
        .await
        .unwrap();
    scheduler.start();

    assert!(wait_until(Duration::from_secs(5), || {
        store
            .rows_snapshot()
            .first()
            .map(|row| row.consecutive_failures == 1)
            .unwrap_or(false)
    }));

    let failing = scheduler
        .get_failing_executions(Duration::from_secs(0))
        .await
        .unwrap();
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].id(), ExecutionId::new("flaky", "1"));
    scheduler.stop();
}
