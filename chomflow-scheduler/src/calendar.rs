//! Cron-expression scheduler.

use crate::driver::{Cadence, Registry, TriggerStats};
use crate::error::ScheduleError;
use chomflow_core::{CoreError, Scheduler, TickFn, TriggerHandle};
use cron::Schedule;
use std::str::FromStr;
use tokio::runtime::Handle;

/// Fires triggers on cron expressions with a seconds field, evaluated in UTC.
///
/// `"* * * * * *"` fires every second, `"0 */5 * * * *"` every five minutes.
#[derive(Default)]
pub struct CronScheduler {
    registry: Registry,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a cron expression.
    pub fn parse(expr: &str) -> Result<Schedule, ScheduleError> {
        Schedule::from_str(expr.trim()).map_err(|e| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
    }

    /// Number of installed triggers still running.
    pub fn active_triggers(&self) -> usize {
        self.registry.active()
    }

    pub fn stats(&self) -> TriggerStats {
        self.registry.stats()
    }

    /// Cancels every trigger installed through this scheduler.
    pub fn shutdown(&self) {
        tracing::info!("cron scheduler shutting down");
        self.registry.shutdown();
    }
}

impl Scheduler for CronScheduler {
    fn schedule(
        &self,
        cadence: &str,
        singleton: bool,
        tick: TickFn,
    ) -> Result<Box<dyn TriggerHandle>, CoreError> {
        let schedule = Self::parse(cadence)?;
        let runtime = Handle::try_current().map_err(|_| CoreError::NoRuntime)?;
        Ok(self.registry.launch(
            &runtime,
            cadence,
            Cadence::Calendar(Box::new(schedule)),
            singleton,
            tick,
        ))
    }
}
