//! In-memory execution store for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::core::{Execution, ExecutionId, SchedulerError};
use crate::store::ExecutionStore;

/// Execution store backed by a mutex-protected hash map.
///
/// Implements the full picking protocol, including the fused `pick_due`, so
/// the scheduler behaves identically against it and against a database.
/// Multiple schedulers can share the same rows via [`Self::shared_with_name`],
/// which is how cluster scenarios are exercised in tests.
pub struct InMemoryExecutionStore {
    scheduler_name: String,
    rows: Arc<Mutex<HashMap<ExecutionId, Execution>>>,
}

impl InMemoryExecutionStore {
    /// An empty store picking rows as `scheduler_name`.
    pub fn new(scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A second handle onto the same rows, picking under a different name.
    /// Models a peer scheduler attached to the same database.
    pub fn shared_with_name(&self, scheduler_name: impl Into<String>) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            rows: Arc::clone(&self.rows),
        }
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Copy of all rows, for diagnostics and tests.
    pub fn rows_snapshot(&self) -> Vec<Execution> {
        self.rows.lock().values().cloned().collect()
    }

    fn due_candidates(
        rows: &HashMap<ExecutionId, Execution>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<Execution> {
        let mut due: Vec<Execution> = rows
            .values()
            .filter(|e| !e.picked && e.execution_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.execution_time);
        due.truncate(limit);
        due
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_if_not_exists(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        let id = execution.id();
        if rows.contains_key(&id) {
            return Ok(false);
        }
        rows.insert(id, execution.clone());
        Ok(true)
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        Ok(Self::due_candidates(&rows, now, limit))
    }

    async fn pick(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<Option<Execution>, SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&execution.id()) {
            Some(row) if !row.picked && row.version == execution.version => {
                row.picked = true;
                row.picked_by = Some(self.scheduler_name.clone());
                row.last_heartbeat = Some(now);
                row.version += 1;
                Ok(Some(row.clone()))
            }
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    async fn pick_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let mut rows = self.rows.lock();
        let due = Self::due_candidates(&rows, now, limit);
        let mut picked = Vec::with_capacity(due.len());
        for candidate in due {
            if let Some(row) = rows.get_mut(&candidate.id()) {
                row.picked = true;
                row.picked_by = Some(self.scheduler_name.clone());
                row.last_heartbeat = Some(now);
                row.version += 1;
                picked.push(row.clone());
            }
        }
        Ok(picked)
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&execution.id()) {
            Some(row) => {
                row.last_heartbeat = Some(now);
                Ok(())
            }
            None => {
                warn!(execution = %execution.id(), "heartbeat for missing row, ignoring");
                Ok(())
            }
        }
    }

    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        let mut old: Vec<Execution> = rows
            .values()
            .filter(|e| e.picked && e.last_heartbeat.is_some_and(|hb| hb < older_than))
            .cloned()
            .collect();
        old.sort_by_key(|e| e.last_heartbeat);
        Ok(old)
    }

    async fn get_executions_failing_longer_than(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let boundary =
            now - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        let rows = self.rows.lock();
        let mut failing: Vec<Execution> = rows
            .values()
            .filter(|e| {
                !e.picked
                    && e.consecutive_failures > 0
                    && e.last_success.map_or(true, |s| s < boundary)
            })
            .cloned()
            .collect();
        failing.sort_by_key(|e| e.execution_time);
        Ok(failing)
    }

    async fn reschedule(
        &self,
        execution: &Execution,
        next_execution_time: DateTime<Utc>,
        new_payload: Option<Vec<u8>>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: u32,
    ) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&execution.id()) {
            Some(row) if row.version == execution.version => {
                row.picked = false;
                row.picked_by = None;
                row.last_heartbeat = None;
                row.execution_time = next_execution_time;
                row.last_success = last_success;
                row.last_failure = last_failure;
                row.consecutive_failures = consecutive_failures;
                if let Some(payload) = new_payload {
                    row.task_instance.payload = Some(payload);
                }
                row.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get(&execution.id()) {
            Some(row) if row.version == execution.version => {
                rows.remove(&execution.id());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_payload(
        &self,
        execution: &Execution,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&execution.id()) {
            Some(row) if row.version == execution.version => {
                row.task_instance.payload = new_payload;
                row.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_execution(
        &self,
        task_name: &str,
        instance_id: &str,
    ) -> Result<Option<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        Ok(rows
            .get(&ExecutionId::new(task_name, instance_id))
            .cloned())
    }

    async fn get_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        let mut executions: Vec<Execution> = rows
            .values()
            .filter(|e| e.task_name() == task_name)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.execution_time);
        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskInstance;

    fn execution(task: &str, instance: &str, due: DateTime<Utc>) -> Execution {
        Execution::new(TaskInstance::new(task, instance), due)
    }

    #[tokio::test]
    async fn create_is_exclusive_per_identity() {
        let store = InMemoryExecutionStore::new("s1");
        let e = execution("t", "1", Utc::now());
        assert!(store.create_if_not_exists(&e).await.unwrap());
        assert!(!store.create_if_not_exists(&e).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn pick_claims_once_and_stamps_owner() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();
        let e = execution("t", "1", now);
        store.create_if_not_exists(&e).await.unwrap();

        let picked = store.pick(&e, now).await.unwrap().unwrap();
        assert!(picked.picked);
        assert_eq!(picked.picked_by.as_deref(), Some("s1"));
        assert_eq!(picked.last_heartbeat, Some(now));
        assert_eq!(picked.version, e.version + 1);

        // Same observed version again: lost race.
        assert!(store.pick(&e, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn peer_store_shares_rows_but_not_name() {
        let a = InMemoryExecutionStore::new("a");
        let b = a.shared_with_name("b");
        let now = Utc::now();
        let e = execution("t", "1", now);
        a.create_if_not_exists(&e).await.unwrap();

        let picked = b.pick(&e, now).await.unwrap().unwrap();
        assert_eq!(picked.picked_by.as_deref(), Some("b"));
        assert!(a.pick(&e, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_due_orders_by_execution_time_and_skips_picked() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();
        let early = execution("t", "early", now - chrono::Duration::seconds(20));
        let late = execution("t", "late", now - chrono::Duration::seconds(5));
        let future = execution("t", "future", now + chrono::Duration::seconds(60));
        for e in [&early, &late, &future] {
            store.create_if_not_exists(e).await.unwrap();
        }
        store.pick(&late, now).await.unwrap().unwrap();

        let due = store.get_due(now, 10).await.unwrap();
        let ids: Vec<String> = due
            .iter()
            .map(|e| e.task_instance.instance_id.clone())
            .collect();
        assert_eq!(ids, vec!["early"]);
    }

    #[tokio::test]
    async fn pick_due_fuses_fetch_and_claim() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();
        for i in 0..3 {
            let e = execution("t", &i.to_string(), now - chrono::Duration::seconds(i));
            store.create_if_not_exists(&e).await.unwrap();
        }

        let picked = store.pick_due(now, 2).await.unwrap();
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|e| e.picked));
        // One unpicked row remains due.
        assert_eq!(store.get_due(now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reschedule_clears_pick_and_bumps_version() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();
        let e = execution("t", "1", now);
        store.create_if_not_exists(&e).await.unwrap();
        let picked = store.pick(&e, now).await.unwrap().unwrap();

        let next = now + chrono::Duration::seconds(300);
        assert!(store
            .reschedule(&picked, next, None, Some(now), None, 0)
            .await
            .unwrap());

        let row = store.get_execution("t", "1").await.unwrap().unwrap();
        assert!(!row.picked);
        assert!(row.picked_by.is_none());
        assert!(row.last_heartbeat.is_none());
        assert_eq!(row.execution_time, next);
        assert_eq!(row.version, picked.version + 1);

        // Stale reschedule from the pre-pick snapshot loses.
        assert!(!store.reschedule(&e, next, None, None, None, 0).await.unwrap());
    }

    #[tokio::test]
    async fn remove_is_version_checked() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();
        let e = execution("t", "1", now);
        store.create_if_not_exists(&e).await.unwrap();
        let picked = store.pick(&e, now).await.unwrap().unwrap();

        assert!(!store.remove(&e).await.unwrap());
        assert!(store.remove(&picked).await.unwrap());
        assert!(store.get_execution("t", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn old_executions_need_picked_and_stale_heartbeat() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();
        let e = execution("t", "1", now);
        store.create_if_not_exists(&e).await.unwrap();
        let picked_at = now - chrono::Duration::seconds(600);
        store.pick(&e, picked_at).await.unwrap().unwrap();

        let old = store
            .get_old_executions(now - chrono::Duration::seconds(300))
            .await
            .unwrap();
        assert_eq!(old.len(), 1);

        let old = store
            .get_old_executions(now - chrono::Duration::seconds(900))
            .await
            .unwrap();
        assert!(old.is_empty());
    }

    #[tokio::test]
    async fn failing_listing_filters_on_failures_and_success_age() {
        let store = InMemoryExecutionStore::new("s1");
        let now = Utc::now();

        let mut failing = execution("t", "failing", now);
        failing.consecutive_failures = 3;
        failing.last_success = Some(now - chrono::Duration::seconds(3600));
        store.create_if_not_exists(&failing).await.unwrap();

        let mut healthy = execution("t", "healthy", now);
        healthy.last_success = Some(now);
        store.create_if_not_exists(&healthy).await.unwrap();

        let listed = store
            .get_executions_failing_longer_than(now, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_instance.instance_id, "failing");
    }
}
