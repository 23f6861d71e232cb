//! Trigger loop shared by every scheduler.

use chomflow_core::{TickFn, TriggerHandle};
use chrono::Utc;
use cron::Schedule;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;

/// When a trigger fires.
pub(crate) enum Cadence {
    /// Next upcoming time of a cron schedule, in UTC.
    Calendar(Box<Schedule>),
    /// Fixed period, first firing one period after installation.
    Every(Duration),
}

impl Cadence {
    /// Returns the wait until the next firing, or `None` if there is none.
    fn next_delay(&self) -> Option<Duration> {
        match self {
            Cadence::Calendar(schedule) => {
                let next = schedule.upcoming(Utc).next()?;
                Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
            Cadence::Every(period) => Some(*period),
        }
    }
}

/// Shared state of one installed trigger.
pub(crate) struct TriggerState {
    label: String,
    cancelled: AtomicBool,
    busy: AtomicBool,
    notify: Notify,
    fired: AtomicU64,
    skipped: AtomicU64,
}

impl TriggerState {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            cancelled: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            notify: Notify::new(),
            fired: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    fn fire(self: &Arc<Self>, singleton: bool, tick: &TickFn) {
        if singleton && self.busy.swap(true, Ordering::AcqRel) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cadence = %self.label, "previous firing still running, skipped");
            return;
        }
        self.fired.fetch_add(1, Ordering::Relaxed);

        let busy = singleton.then(|| BusyGuard(self.clone()));
        let tick = tick.clone();
        tokio::spawn(async move {
            let _busy = busy;
            tick();
        });
    }

    async fn run(self: Arc<Self>, cadence: Cadence, singleton: bool, tick: TickFn) {
        tracing::debug!(cadence = %self.label, singleton, "trigger started");

        loop {
            let Some(delay) = cadence.next_delay() else {
                tracing::info!(cadence = %self.label, "no upcoming firing, trigger finished");
                break;
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }

            if self.is_cancelled() {
                break;
            }

            self.fire(singleton, &tick);
        }

        tracing::debug!(
            cadence = %self.label,
            fired = self.fired.load(Ordering::Relaxed),
            skipped = self.skipped.load(Ordering::Relaxed),
            "trigger stopped"
        );
    }
}

/// Clears the busy flag when a singleton firing finishes, even by panic.
struct BusyGuard(Arc<TriggerState>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Handle returned to the core.
struct Trigger(Arc<TriggerState>);

impl TriggerHandle for Trigger {
    fn cancel(&self) {
        self.0.cancel();
    }
}

/// Counters of a trigger, for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStats {
    pub fired: u64,
    pub skipped: u64,
}

/// Triggers launched by one scheduler.
#[derive(Default)]
pub(crate) struct Registry {
    triggers: Mutex<Vec<Weak<TriggerState>>>,
}

impl Registry {
    /// Starts the loop of a new trigger on `runtime`.
    pub(crate) fn launch(
        &self,
        runtime: &Handle,
        label: &str,
        cadence: Cadence,
        singleton: bool,
        tick: TickFn,
    ) -> Box<dyn TriggerHandle> {
        let state = Arc::new(TriggerState::new(label));
        {
            let mut triggers = self.triggers.lock();
            triggers.retain(|t| t.strong_count() > 0);
            triggers.push(Arc::downgrade(&state));
        }

        runtime.spawn(state.clone().run(cadence, singleton, tick));
        Box::new(Trigger(state))
    }

    fn live(&self) -> Vec<Arc<TriggerState>> {
        self.triggers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| !t.is_cancelled())
            .collect()
    }

    /// Number of triggers neither cancelled nor finished.
    pub(crate) fn active(&self) -> usize {
        self.live().len()
    }

    /// Summed counters of the live triggers.
    pub(crate) fn stats(&self) -> TriggerStats {
        self.live()
            .iter()
            .fold(TriggerStats::default(), |acc, t| TriggerStats {
                fired: acc.fired + t.fired.load(Ordering::Relaxed),
                skipped: acc.skipped + t.skipped.load(Ordering::Relaxed),
            })
    }

    /// Cancels every trigger.
    pub(crate) fn shutdown(&self) {
        let triggers = std::mem::take(&mut *self.triggers.lock());
        for trigger in triggers.iter().filter_map(Weak::upgrade) {
            trigger.cancel();
        }
    }
}
