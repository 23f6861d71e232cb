//! Shared helpers for the integration suite.

#![allow(dead_code)]

use chomflow_core::{CoreError, DiagnosticSink, Scheduler, TickFn, TriggerHandle};
use parking_lot::Mutex;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Polls `cond` until it holds, panicking after a few seconds.
pub async fn wait_until<F>(what: &str, cond: F)
where
    F: Fn() -> bool,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("timed out waiting for {}", what);
    }
}

/// Gives spawned tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reported {
    pub flow: String,
    pub phase: String,
    pub message: String,
}

/// Sink that keeps every report in memory.
#[derive(Default)]
pub struct RecordingSink {
    errors: Mutex<Vec<Reported>>,
    notices: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn errors(&self) -> Vec<Reported> {
        self.errors.lock().clone()
    }

    pub fn errors_for(&self, phase: &str) -> Vec<Reported> {
        self.errors
            .lock()
            .iter()
            .filter(|r| r.phase == phase)
            .cloned()
            .collect()
    }

    /// Notices reported for `flow`, oldest first.
    pub fn notices_for(&self, flow: &str) -> Vec<String> {
        self.notices
            .lock()
            .iter()
            .filter(|(f, _)| f == flow)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

/// Shared, ordered log of labels pushed from callbacks.
#[derive(Clone, Default)]
pub struct Trail(Arc<Mutex<Vec<String>>>);

impl Trail {
    pub fn push(&self, label: impl Into<String>) {
        self.0.lock().push(label.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl DiagnosticSink for RecordingSink {
    fn error(&self, flow: &str, phase: &str, error: &dyn Error) {
        self.errors.lock().push(Reported {
            flow: flow.to_string(),
            phase: phase.to_string(),
            message: error.to_string(),
        });
    }

    fn info(&self, flow: &str, message: &str) {
        self.notices
            .lock()
            .push((flow.to_string(), message.to_string()));
    }
}

/// One trigger installed through [`ManualScheduler`].
#[derive(Clone)]
pub struct Installed {
    pub cadence: String,
    pub singleton: bool,
    pub tick: TickFn,
    pub cancelled: Arc<AtomicBool>,
}

impl Installed {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn fire(&self) {
        (self.tick)();
    }
}

struct ManualHandle(Arc<AtomicBool>);

impl TriggerHandle for ManualHandle {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Scheduler that never fires on its own; tests fire installed triggers.
#[derive(Default)]
pub struct ManualScheduler {
    installed: Mutex<Vec<Installed>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn installed(&self) -> Vec<Installed> {
        self.installed.lock().clone()
    }

    pub fn last(&self) -> Option<Installed> {
        self.installed.lock().last().cloned()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(
        &self,
        cadence: &str,
        singleton: bool,
        tick: TickFn,
    ) -> Result<Box<dyn TriggerHandle>, CoreError> {
        if cadence.is_empty() {
            return Err(CoreError::InvalidCadence {
                cadence: cadence.to_string(),
                reason: "empty".to_string(),
            });
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        self.installed.lock().push(Installed {
            cadence: cadence.to_string(),
            singleton,
            tick,
            cancelled: cancelled.clone(),
        });
        Ok(Box::new(ManualHandle(cancelled)))
    }
}
