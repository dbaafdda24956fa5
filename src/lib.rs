//! A Tokio-based bounded-concurrency scheduler for dynamically growing work,
//! with first-failure-wins cancellation and recursive submission from
//! running work units.

mod config;
mod error;
mod notifier;
mod queue;
mod scheduler;
mod unit;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use notifier::{UnitCompletionInfo, UnitCompletionStatus};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStats, ShutdownMode};
pub use unit::{SubmitOutcome, UnitId};
