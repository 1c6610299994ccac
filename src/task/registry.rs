//! Task name → definition resolution.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::core::SchedulerError;
use crate::task::Task;

/// Maps task names to their registered definitions.
///
/// Rows referencing unknown names are never deleted: a later deployment that
/// registers the task will handle them.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<Task>>>,
}

impl TaskRegistry {
    /// A registry preloaded with `tasks`.
    pub fn new(tasks: Vec<Task>) -> Self {
        let registry = Self::default();
        for task in tasks {
            registry.register(task);
        }
        registry
    }

    /// Register a task definition, replacing any previous one with the same
    /// name.
    pub fn register(&self, task: Task) {
        self.tasks
            .write()
            .insert(task.name().to_string(), Arc::new(task));
    }

    /// Look up a task by name. Unknown names are logged; the caller leaves
    /// the row intact.
    pub fn resolve(&self, task_name: &str) -> Option<Arc<Task>> {
        let task = self.tasks.read().get(task_name).cloned();
        if task.is_none() {
            warn!(task = task_name, "found execution with unknown task name");
        }
        task
    }

    /// Like [`Self::resolve`], erroring on unknown names.
    pub fn resolve_required(&self, task_name: &str) -> Result<Arc<Task>, SchedulerError> {
        self.resolve(task_name)
            .ok_or_else(|| SchedulerError::UnknownTask(task_name.to_string()))
    }

    /// Names of all registered tasks.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskInstance;
    use crate::scheduler::ExecutionContext;
    use crate::task::FnHandler;

    fn task(name: &str) -> Task {
        Task::one_time(
            name,
            Arc::new(FnHandler(
                |_: &TaskInstance, _: &ExecutionContext| -> crate::core::AppResult<()> { Ok(()) },
            )),
        )
    }

    #[test]
    fn resolves_registered_names() {
        let registry = TaskRegistry::new(vec![task("a"), task("b")]);
        assert!(registry.resolve("a").is_some());
        assert!(registry.resolve("b").is_some());
        assert!(registry.resolve("c").is_none());
    }

    #[test]
    fn resolve_required_errors_on_unknown_names() {
        let registry = TaskRegistry::new(vec![task("a")]);
        assert!(registry.resolve_required("a").is_ok());
        let err = registry.resolve_required("ghost").unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask(name) if name == "ghost"));
    }

    #[test]
    fn late_registration_wins() {
        let registry = TaskRegistry::new(vec![]);
        assert!(registry.resolve("a").is_none());
        registry.register(task("a"));
        assert!(registry.resolve("a").is_some());
    }
}
