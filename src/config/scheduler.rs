//! Scheduler configuration structures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the due-poll loop fetches and claims work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    /// Fetch a candidate list without locks, then claim each row with a
    /// version-checked update. Works on every backend.
    FetchAndLockSeparately,
    /// Fetch and claim in one round-trip using `FOR UPDATE SKIP LOCKED`.
    /// Falls back to [`Self::FetchAndLockSeparately`] at runtime when the
    /// store does not support it.
    FetchAndLockTogether,
}

/// Batch-sizing knobs for the due-poll loop.
///
/// The limits derive from the worker count: `upper = threads *
/// upper_limit_fraction` bounds one fetch, and with the fused strategy the
/// poll waiter is woken early once in-flight work drops to `lower = threads *
/// lower_limit_fraction` while the last fetch returned a full batch.
/// Under-provisioning the lower limit favors stable batches;
/// over-provisioning favors lower per-task latency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PollStrategyConfig {
    /// Fetch/claim strategy.
    pub strategy: PollStrategy,
    /// Fraction of the worker count used as the early-repoll threshold.
    #[serde(default = "default_lower_limit_fraction")]
    pub lower_limit_fraction: f64,
    /// Fraction of the worker count used as the per-fetch bound.
    #[serde(default = "default_upper_limit_fraction")]
    pub upper_limit_fraction: f64,
}

fn default_lower_limit_fraction() -> f64 {
    0.5
}

fn default_upper_limit_fraction() -> f64 {
    1.0
}

impl Default for PollStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: PollStrategy::FetchAndLockSeparately,
            lower_limit_fraction: default_lower_limit_fraction(),
            upper_limit_fraction: default_upper_limit_fraction(),
        }
    }
}

impl PollStrategyConfig {
    /// In-flight threshold below which the fused strategy re-polls early.
    pub fn lower_limit(&self, threads: usize) -> usize {
        ((threads as f64) * self.lower_limit_fraction).floor() as usize
    }

    /// Maximum executions fetched per poll iteration.
    pub fn upper_limit(&self, threads: usize) -> usize {
        (((threads as f64) * self.upper_limit_fraction).ceil() as usize).max(1)
    }
}

fn default_threads() -> usize {
    10
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_shutdown_max_wait() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_table_name() -> String {
    crate::store::postgres::DEFAULT_TABLE_NAME.to_string()
}

fn default_scheduler_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("scheduler-{}", std::process::id()))
}

/// Scheduler configuration.
///
/// A plain record with defaults applied in one place; `with_*` setters exist
/// for ergonomic construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker pool size: the bound on in-flight executions.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Period of the due-poll loop.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: Duration,
    /// Period of the heartbeat loop. Dead detection runs every 2x this and
    /// considers rows dead after 4x (three consecutive missed heartbeats).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    /// Identity stored in `picked_by` on claimed rows.
    #[serde(default = "default_scheduler_name")]
    pub scheduler_name: String,
    /// Execution table override.
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// Wake the due-poll waiter when a client schedules work that is already
    /// due.
    #[serde(default)]
    pub enable_immediate_execution: bool,
    /// Names of registered recurring tasks whose row is auto-inserted on
    /// startup if absent.
    #[serde(default)]
    pub start_tasks: Vec<String>,
    /// Grace period for in-flight executions during shutdown; afterwards
    /// workers are abandoned and their rows recover via dead detection.
    #[serde(default = "default_shutdown_max_wait")]
    pub shutdown_max_wait: Duration,
    /// Due-poll batch strategy and limits.
    #[serde(default)]
    pub poll_strategy: PollStrategyConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            polling_interval: default_polling_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            scheduler_name: default_scheduler_name(),
            table_name: default_table_name(),
            enable_immediate_execution: false,
            start_tasks: Vec::new(),
            shutdown_max_wait: default_shutdown_max_wait(),
            poll_strategy: PollStrategyConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// A configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool size.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the due-poll period.
    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the heartbeat period.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the scheduler identity.
    #[must_use]
    pub fn with_scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = name.into();
        self
    }

    /// Set the execution table name.
    #[must_use]
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Wake the poll loop for already-due schedule calls.
    #[must_use]
    pub fn enable_immediate_execution(mut self) -> Self {
        self.enable_immediate_execution = true;
        self
    }

    /// Auto-insert these recurring tasks' rows on startup.
    #[must_use]
    pub fn with_start_tasks(mut self, task_names: Vec<String>) -> Self {
        self.start_tasks = task_names;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_max_wait(mut self, wait: Duration) -> Self {
        self.shutdown_max_wait = wait;
        self
    }

    /// Set the poll strategy and its limits.
    #[must_use]
    pub fn with_poll_strategy(mut self, poll_strategy: PollStrategyConfig) -> Self {
        self.poll_strategy = poll_strategy;
        self
    }

    /// Rows are considered dead after this long without a heartbeat.
    pub fn dead_after(&self) -> Duration {
        self.heartbeat_interval * 4
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.threads == 0 {
            return Err("threads must be greater than 0".into());
        }
        if self.polling_interval.is_zero() {
            return Err("polling_interval must be greater than 0".into());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be greater than 0".into());
        }
        if self.scheduler_name.is_empty() {
            return Err("scheduler_name must not be empty".into());
        }
        if self.table_name.is_empty()
            || !self
                .table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!(
                "table_name `{}` must be a plain identifier (ascii alphanumerics and underscores)",
                self.table_name
            ));
        }
        if !(0.0..=1.0).contains(&self.poll_strategy.lower_limit_fraction) {
            return Err("lower_limit_fraction must be within [0, 1]".into());
        }
        if self.poll_strategy.upper_limit_fraction <= 0.0 {
            return Err("upper_limit_fraction must be greater than 0".into());
        }
        Ok(())
    }
}
