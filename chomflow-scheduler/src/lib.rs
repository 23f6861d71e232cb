//! # chomflow-scheduler
//!
//! Periodic-trigger providers for chomflow.
//!
//! Both schedulers implement [`chomflow_core::Scheduler`] and run each
//! installed trigger as its own tokio task:
//! - [`CronScheduler`]: six-field cron expressions (with seconds), UTC
//! - [`IntervalScheduler`]: fixed periods such as `"250ms"` or `"2s"`

pub mod calendar;
mod driver;
pub mod error;
pub mod interval;

pub use calendar::CronScheduler;
pub use driver::TriggerStats;
pub use error::ScheduleError;
pub use interval::IntervalScheduler;
