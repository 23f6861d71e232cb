//! State definitions.
//!
//! A state is a bundle of four callbacks plus a retry budget:
//!
//! ```ignore
//! let start = StateDefinition::basic(
//!     StateBuilder::new("start")
//!         .retry_count(2)
//!         .on_ready(|ctx| {
//!             ctx.next("work")?;
//!             Ok(())
//!         }),
//! );
//! ```

use crate::context::FlowContext;
use crate::error::CallbackError;
use crate::trigger::{Scheduler, TickFn, TriggerSlot};
use std::fmt;
use std::sync::{Arc, Weak};

/// Enter, ready and exit callback.
pub type StateFn = Arc<dyn Fn(&Arc<FlowContext>) -> Result<(), CallbackError> + Send + Sync>;

/// Error callback, invoked once a phase has exhausted its retries.
pub type ErrorFn = Arc<dyn Fn(&Arc<FlowContext>, Phase, &CallbackError) + Send + Sync>;

/// Transient key under which a periodic state keeps its trigger.
pub const TRIGGER_KEY: &str = "___scheduler";

/// Lifecycle phase a callback failure is reported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Enter,
    Ready,
    Exit,
    /// A periodic firing.
    Cron,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Enter => "enter",
            Phase::Ready => "ready",
            Phase::Exit => "exit",
            Phase::Cron => "cron",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial state definition. Unset callbacks get defaults when built.
#[derive(Clone, Default)]
pub struct StateBuilder {
    name: String,
    retry_count: u32,
    on_enter: Option<StateFn>,
    on_ready: Option<StateFn>,
    on_exit: Option<StateFn>,
    on_error: Option<ErrorFn>,
}

impl StateBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Extra attempts per phase after the first failure.
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn on_enter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<FlowContext>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_enter = Some(Arc::new(f));
        self
    }

    pub fn on_ready<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<FlowContext>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_ready = Some(Arc::new(f));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<FlowContext>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<FlowContext>, Phase, &CallbackError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Periodic part of a state built with [`StateDefinition::periodic`].
#[derive(Clone)]
pub struct PeriodicTrigger {
    scheduler: Arc<dyn Scheduler>,
    cadence: String,
    singleton: bool,
    callback: Option<StateFn>,
}

impl PeriodicTrigger {
    /// Creates a trigger firing at `cadence`, in the scheduler's syntax.
    pub fn new(scheduler: Arc<dyn Scheduler>, cadence: impl Into<String>) -> Self {
        Self {
            scheduler,
            cadence: cadence.into(),
            singleton: false,
            callback: None,
        }
    }

    /// Skip a firing while the previous one is still running.
    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Callback run inside a transaction on every firing.
    pub fn on_tick<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<FlowContext>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }
}

/// Immutable state definition shared by every flow occupying the state.
pub struct StateDefinition {
    pub name: String,
    pub retry_count: u32,
    on_enter: StateFn,
    on_ready: StateFn,
    on_exit: StateFn,
    on_error: ErrorFn,
}

impl StateDefinition {
    /// Builds a state, filling unset callbacks with defaults.
    pub fn basic(builder: StateBuilder) -> Self {
        Self {
            name: builder.name,
            retry_count: builder.retry_count,
            on_enter: builder.on_enter.unwrap_or_else(noop),
            on_ready: builder.on_ready.unwrap_or_else(noop),
            on_exit: builder.on_exit.unwrap_or_else(noop),
            on_error: builder.on_error.unwrap_or_else(report_error),
        }
    }

    /// Builds a state whose ready phase installs a periodic trigger and whose
    /// exit phase cancels it.
    pub fn periodic(builder: StateBuilder, trigger: PeriodicTrigger) -> Self {
        let on_error = builder.on_error.clone().unwrap_or_else(report_error);

        let user_ready = builder.on_ready.clone();
        let ready_error = on_error.clone();
        let on_ready: StateFn = Arc::new(move |ctx: &Arc<FlowContext>| -> Result<(), CallbackError> {
            cancel_trigger(ctx);

            if let Some(ready) = &user_ready {
                ready(ctx)?;
            }

            let tick = tick_fn(Arc::downgrade(ctx), trigger.callback.clone(), ready_error.clone());
            let handle = trigger
                .scheduler
                .schedule(&trigger.cadence, trigger.singleton, tick)?;
            ctx.context_storage()
                .write()
                .set_transient(TRIGGER_KEY, TriggerSlot(handle));

            tracing::debug!(
                flow = %ctx.flow_name(),
                cadence = %trigger.cadence,
                "periodic trigger installed"
            );
            Ok(())
        });

        let user_exit = builder.on_exit.clone();
        let on_exit: StateFn = Arc::new(move |ctx: &Arc<FlowContext>| -> Result<(), CallbackError> {
            cancel_trigger(ctx);
            match &user_exit {
                Some(exit) => exit(ctx),
                None => Ok(()),
            }
        });

        Self {
            name: builder.name,
            retry_count: builder.retry_count,
            on_enter: builder.on_enter.unwrap_or_else(noop),
            on_ready,
            on_exit,
            on_error,
        }
    }

    /// Runs enter then ready, each with the retry budget.
    pub(crate) fn enter(&self, ctx: &Arc<FlowContext>) -> Result<(), CallbackError> {
        self.attempt(ctx, Phase::Enter, &self.on_enter)?;
        self.attempt(ctx, Phase::Ready, &self.on_ready)
    }

    /// Runs exit with the retry budget.
    pub(crate) fn exit(&self, ctx: &Arc<FlowContext>) -> Result<(), CallbackError> {
        self.attempt(ctx, Phase::Exit, &self.on_exit)
    }

    /// Calls `f` up to `retry_count + 1` times. Only the last failure reaches
    /// the error callback.
    fn attempt(
        &self,
        ctx: &Arc<FlowContext>,
        phase: Phase,
        f: &StateFn,
    ) -> Result<(), CallbackError> {
        let mut attempt = 0;
        loop {
            match f(ctx) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry_count => {
                    (self.on_error)(ctx, phase, &e);
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    tracing::debug!(
                        flow = %ctx.flow_name(),
                        state = %self.name,
                        %phase,
                        attempt,
                        error = %e,
                        "callback failed, retrying"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for StateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDefinition")
            .field("name", &self.name)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

fn noop() -> StateFn {
    fn ok(_: &Arc<FlowContext>) -> Result<(), CallbackError> {
        Ok(())
    }
    Arc::new(ok)
}

fn report_error() -> ErrorFn {
    Arc::new(|ctx: &Arc<FlowContext>, phase: Phase, err: &CallbackError| {
        ctx.diagnostics()
            .error(ctx.flow_name(), phase.as_str(), err.as_ref());
    })
}

fn cancel_trigger(ctx: &Arc<FlowContext>) {
    let slot = ctx
        .context_storage()
        .write()
        .take_transient::<TriggerSlot>(TRIGGER_KEY);
    if let Some(slot) = slot {
        slot.0.cancel();
    }
}

/// Builds the function a scheduler calls on every firing. Holds the context
/// weakly so an abandoned trigger does not keep the flow alive.
fn tick_fn(ctx: Weak<FlowContext>, callback: Option<StateFn>, on_error: ErrorFn) -> TickFn {
    Arc::new(move || {
        let Some(callback) = &callback else {
            return;
        };
        let Some(ctx) = ctx.upgrade() else {
            return;
        };

        let result = ctx.transaction(|| {
            callback(&ctx).map_err(|e| {
                on_error(&ctx, Phase::Cron, &e);
                e
            })
        });
        if let Err(e) = result {
            tracing::debug!(flow = %ctx.flow_name(), error = %e, "periodic firing skipped");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Enter.to_string(), "enter");
        assert_eq!(Phase::Ready.as_str(), "ready");
        assert_eq!(Phase::Exit.as_str(), "exit");
        assert_eq!(Phase::Cron.as_str(), "cron");
    }

    #[test]
    fn test_basic_keeps_name_and_budget() {
        let def = StateDefinition::basic(StateBuilder::new("start").retry_count(3));
        assert_eq!(def.name, "start");
        assert_eq!(def.retry_count, 3);
    }
}
