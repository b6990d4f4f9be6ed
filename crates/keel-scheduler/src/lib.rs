//! Trigger scheduling for Keel CI.
//!
//! Triggers decide when a project builds: cron triggers fire on a schedule,
//! SCM triggers fire when a new revision is announced on the bus. A trigger
//! never has more than one build pending; missed cron fires are dropped.

pub mod schedule;
mod scheduler;
pub mod task;
pub mod trigger;

pub use schedule::CronExpression;
pub use scheduler::Scheduler;
pub use task::{BuildRequestTask, FiringReport, FnTask, Task, TaskExecutionContext, TaskFailure};
pub use trigger::{TriggerInfo, TriggerKind, TriggerState};
