//! Fixed-interval scheduler.

use crate::driver::{Cadence, Registry, TriggerStats};
use crate::error::ScheduleError;
use chomflow_core::{CoreError, Scheduler, TickFn, TriggerHandle};
use std::time::Duration;
use tokio::runtime::Handle;

/// Fires triggers at a fixed period written as a number and a unit:
/// `"250ms"`, `"2s"`, `"1m"` or `"1h"`.
#[derive(Default)]
pub struct IntervalScheduler {
    registry: Registry,
}

impl IntervalScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an interval.
    pub fn parse(cadence: &str) -> Result<Duration, ScheduleError> {
        let invalid = |reason: &str| ScheduleError::InvalidInterval {
            cadence: cadence.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = cadence.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid("missing unit (ms, s, m or h)"))?;
        let (amount, unit) = trimmed.split_at(split);
        if amount.is_empty() {
            return Err(invalid("missing amount"));
        }
        let amount: u64 = amount.parse().map_err(|_| invalid("amount out of range"))?;

        let period = match unit {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            _ => return Err(invalid("unknown unit, expected ms, s, m or h")),
        };

        if period.is_zero() {
            return Err(ScheduleError::ZeroInterval {
                cadence: cadence.to_string(),
            });
        }
        Ok(period)
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
        tracing::info!("interval scheduler shutting down");
        self.registry.shutdown();
    }
}

impl Scheduler for IntervalScheduler {
    fn schedule(
        &self,
        cadence: &str,
        singleton: bool,
        tick: TickFn,
    ) -> Result<Box<dyn TriggerHandle>, CoreError> {
        let period = Self::parse(cadence)?;
        let runtime = Handle::try_current().map_err(|_| CoreError::NoRuntime)?;
        Ok(self
            .registry
            .launch(&runtime, cadence, Cadence::Every(period), singleton, tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[test]
    fn test_parse_units() {
        assert_eq!(
            IntervalScheduler::parse("250ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(IntervalScheduler::parse("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(IntervalScheduler::parse("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(
            IntervalScheduler::parse(" 1h ").unwrap(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_rejects() {
        for bad in ["", "10", "ms", "5d", "1.5s", "-1s"] {
            let err = IntervalScheduler::parse(bad).unwrap_err();
            assert!(
                matches!(err, ScheduleError::InvalidInterval { .. }),
                "{bad}: {err}"
            );
        }
        assert!(matches!(
            IntervalScheduler::parse("0ms"),
            Err(ScheduleError::ZeroInterval { .. })
        ));
    }

    #[tokio::test]
    async fn test_fires_repeatedly() {
        let scheduler = IntervalScheduler::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let counted = ticks.clone();
        let tick: TickFn = Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let handle = scheduler.schedule("10ms", false, tick).unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(2), async {
            while ticks.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(fired.is_ok());
        assert!(scheduler.stats().fired >= 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_cancel = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_singleton_never_overlaps() {
        let scheduler = IntervalScheduler::new();
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_in_flight = Arc::new(AtomicU32::new(0));
        let runs = Arc::new(AtomicU32::new(0));

        let (current, max, count) = (in_flight.clone(), max_in_flight.clone(), runs.clone());
        let tick: TickFn = Arc::new(move || {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(40));
            current.fetch_sub(1, Ordering::SeqCst);
            count.fetch_add(1, Ordering::SeqCst);
        });

        let _handle = scheduler.schedule("5ms", true, tick).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown();

        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(scheduler.active_triggers() == 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all() {
        let scheduler = IntervalScheduler::new();
        let tick: TickFn = Arc::new(|| {});

        let _a = assert_ok!(scheduler.schedule("1h", false, tick.clone()));
        let _b = assert_ok!(scheduler.schedule("1h", true, tick));
        assert_eq!(scheduler.active_triggers(), 2);

        scheduler.shutdown();
        assert_eq!(scheduler.active_triggers(), 0);
    }
}
