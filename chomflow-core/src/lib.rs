//! # chomflow-core
//!
//! Flow engine for chomflow.
//!
//! This crate provides:
//! - State definitions with enter, ready, exit and error callbacks
//! - Named flows, including child flows sharing their parent's scopes
//! - The transaction protocol staging and committing side effects
//! - Scoped key/value storage (global, state, flow, local, context)
//! - The seam to periodic-trigger providers

pub mod context;
pub mod definition;
pub mod diagnostics;
pub mod error;
pub mod flow;
pub mod machine;
pub mod storage;
pub mod trigger;

pub use context::{ContextAction, EventHandler, FlowAndState, FlowContext};
pub use definition::{ErrorFn, PeriodicTrigger, Phase, StateBuilder, StateDefinition, StateFn};
pub use diagnostics::{DiagnosticSink, TracingSink};
pub use error::{CallbackError, CoreError, ErrorKind};
pub use flow::{Flow, LocalStorages};
pub use machine::{Machine, MachineDefinition};
pub use storage::{Scope, Storage, StorageRef};
pub use trigger::{Scheduler, TickFn, TriggerHandle};
