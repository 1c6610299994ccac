//! Configuration models for the scheduler and its poll strategies.

pub mod scheduler;

pub use scheduler::{PollStrategy, PollStrategyConfig, SchedulerConfig};
