//! Seam to periodic-trigger providers.
//!
//! The core never keeps time itself. A periodic state asks a [`Scheduler`] to
//! call a tick function at some cadence and cancels it through the returned
//! [`TriggerHandle`] when the state exits. Cadence syntax belongs to the
//! provider.

use crate::error::CoreError;
use std::fmt;
use std::sync::Arc;

/// Function invoked on every firing.
pub type TickFn = Arc<dyn Fn() + Send + Sync>;

/// Provider of periodic callbacks.
pub trait Scheduler: Send + Sync {
    /// Starts calling `tick` at `cadence`.
    ///
    /// In singleton mode a firing is skipped while the previous one is still
    /// running.
    fn schedule(
        &self,
        cadence: &str,
        singleton: bool,
        tick: TickFn,
    ) -> Result<Box<dyn TriggerHandle>, CoreError>;
}

/// Handle to an installed periodic callback.
pub trait TriggerHandle: Send + Sync {
    /// Stops future firings. A firing already in progress is not interrupted.
    /// Calling it more than once has no further effect.
    fn cancel(&self);
}

/// Transient-storage slot holding the installed trigger of a periodic state.
/// Dropping the slot cancels the trigger.
pub(crate) struct TriggerSlot(pub(crate) Box<dyn TriggerHandle>);

impl Drop for TriggerSlot {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl fmt::Debug for TriggerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TriggerSlot")
    }
}
