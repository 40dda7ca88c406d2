//! Cron scheduling
//!
//! - [`CronExpr`]: 5-field expression parser and fire-time calculator
//! - [`CronRegistry`]: in-process scheduler of named jobs
//! - [`CronSync`]: mirrors a deploy's job schedules into the OS crontab

pub mod expr;
pub mod scheduler;
pub mod sync;

pub use expr::{CronExpr, CronField, CronParseError};
pub use scheduler::{
    CronRegistry, CronTask, InitReport, JobState, RejectedJob, SystemClock, TokioClock, WallClock, parse_timezone,
    task_fn,
};
pub use sync::{CronSync, SyncReport, render_crontab};
