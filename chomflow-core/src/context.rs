//! Flow contexts and the transaction protocol.
//!
//! A [`FlowContext`] binds a flow to its current state. Callbacks stage side
//! effects on it between [`FlowContext::start_transaction`] and
//! [`FlowContext::commit`]:
//!
//! ```text
//! Idle --start_transaction--> Open --commit--> Committing --> Idle
//!                              |
//!                              +--rollback--> Idle
//! ```
//!
//! Commit applies the staged [`ContextAction`] in a fixed order: stop the
//! current flow, start independent flows, start child flows, resume the parent,
//! then move the current flow to its next state.

use crate::definition::StateDefinition;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::{CallbackError, CoreError};
use crate::flow::Flow;
use crate::machine::Machine;
use crate::storage::{Scope, StorageRef};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Registered event handler. Nothing in the engine dispatches events yet.
pub type EventHandler =
    Arc<dyn Fn(&Arc<FlowContext>, &[Value]) -> Result<(), CallbackError> + Send + Sync>;

/// A (flow name, state name) pair staged for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowAndState {
    pub flow: String,
    pub state: String,
}

impl FlowAndState {
    pub fn new(flow: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            flow: flow.into(),
            state: state.into(),
        }
    }
}

/// Side effects staged by an open transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextAction {
    /// Stop the current flow.
    pub stop: bool,
    /// Resume the parent flow at this state.
    pub parent: Option<String>,
    /// Move the current flow to this state.
    pub next_state: Option<String>,
    /// Child flows to start, in order.
    pub children: Vec<FlowAndState>,
    /// Independent flows to start, in order.
    pub starts: Vec<FlowAndState>,
}

impl ContextAction {
    /// Returns true if something keeps the current flow going.
    fn continues(&self) -> bool {
        self.next_state.is_some() || self.parent.is_some() || !self.children.is_empty()
    }

    fn stage_stop(&mut self) -> Result<(), CoreError> {
        if self.continues() {
            return Err(CoreError::StopConflict);
        }
        self.stop = true;
        Ok(())
    }
}

/// Scope bindings of a context.
pub(crate) struct Bindings {
    pub(crate) state: Arc<StateDefinition>,
    pub(crate) global: StorageRef,
    pub(crate) state_storage: StorageRef,
    pub(crate) flow: StorageRef,
    pub(crate) local: StorageRef,
    pub(crate) context: StorageRef,
    pub(crate) parent: Option<Arc<Flow>>,
}

#[derive(Default)]
struct Control {
    action: Option<ContextAction>,
    running: bool,
    committing: bool,
}

/// Live binding of a flow to one state.
pub struct FlowContext {
    flow_name: String,
    flow: Weak<Flow>,
    machine: Weak<Machine>,
    bindings: RwLock<Bindings>,
    control: Mutex<Control>,
    events: Mutex<HashMap<String, Option<EventHandler>>>,
}

impl FlowContext {
    pub(crate) fn new(
        flow_name: String,
        flow: Weak<Flow>,
        machine: Weak<Machine>,
        bindings: Bindings,
    ) -> Self {
        Self {
            flow_name,
            flow,
            machine,
            bindings: RwLock::new(bindings),
            control: Mutex::new(Control::default()),
            events: Mutex::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Returns the owning flow.
    pub fn flow(&self) -> Option<Arc<Flow>> {
        self.flow.upgrade()
    }

    /// Returns the owning machine.
    pub fn machine(&self) -> Result<Arc<Machine>, CoreError> {
        self.machine.upgrade().ok_or(CoreError::MachineDropped)
    }

    /// Returns the machine's diagnostic sink, or a tracing sink once the
    /// machine is gone.
    pub fn diagnostics(&self) -> Arc<dyn DiagnosticSink> {
        match self.machine.upgrade() {
            Some(machine) => machine.diagnostics(),
            None => Arc::new(TracingSink),
        }
    }

    /// Returns the state this context is bound to.
    pub fn current_state(&self) -> Arc<StateDefinition> {
        self.bindings.read().state.clone()
    }

    pub fn state_name(&self) -> String {
        self.bindings.read().state.name.clone()
    }

    /// Returns the parent flow, `None` for root flows.
    pub fn parent_flow(&self) -> Option<Arc<Flow>> {
        self.bindings.read().parent.clone()
    }

    pub fn is_root(&self) -> bool {
        self.bindings.read().parent.is_none()
    }

    /// Returns the storage bound to `scope`.
    pub fn storage(&self, scope: Scope) -> StorageRef {
        let bindings = self.bindings.read();
        match scope {
            Scope::Global => bindings.global.clone(),
            Scope::State => bindings.state_storage.clone(),
            Scope::Flow => bindings.flow.clone(),
            Scope::Local => bindings.local.clone(),
            Scope::Context => bindings.context.clone(),
        }
    }

    pub fn global(&self) -> StorageRef {
        self.storage(Scope::Global)
    }

    pub fn state_storage(&self) -> StorageRef {
        self.storage(Scope::State)
    }

    pub fn flow_storage(&self) -> StorageRef {
        self.storage(Scope::Flow)
    }

    pub fn local(&self) -> StorageRef {
        self.storage(Scope::Local)
    }

    pub fn context_storage(&self) -> StorageRef {
        self.storage(Scope::Context)
    }

    pub fn is_running(&self) -> bool {
        self.control.lock().running
    }

    pub fn is_committing(&self) -> bool {
        self.control.lock().committing
    }

    /// Returns true while a transaction is open.
    pub fn has_transaction(&self) -> bool {
        self.control.lock().action.is_some()
    }

    /// Returns a copy of the staged action, if a transaction is open.
    pub fn staged(&self) -> Option<ContextAction> {
        self.control.lock().action.clone()
    }

    // =========================================================================
    // Rebinding (used by the machine factory)
    // =========================================================================

    /// Binds this context to a new state and clears the context scope.
    pub(crate) fn rebind(
        &self,
        state: Arc<StateDefinition>,
        state_storage: StorageRef,
        local: StorageRef,
    ) {
        let context = {
            let mut bindings = self.bindings.write();
            bindings.state = state;
            bindings.state_storage = state_storage;
            bindings.local = local;
            bindings.context.clone()
        };
        context.write().clear();
    }

    /// Makes this context share a parent's flow and local scopes.
    pub(crate) fn adopt(&self, parent: Arc<Flow>, flow: StorageRef, local: StorageRef) {
        let mut bindings = self.bindings.write();
        bindings.parent = Some(parent);
        bindings.flow = flow;
        bindings.local = local;
    }

    // =========================================================================
    // Other flows
    // =========================================================================

    /// Returns the context of another flow of the same machine.
    pub fn context_of(&self, flow: &str) -> Option<Arc<FlowContext>> {
        let machine = self.machine.upgrade()?;
        let flow = machine.flow(flow)?;
        Some(flow.context().clone())
    }

    /// Returns the context of `flow`, creating an idle flow at this context's
    /// current state if none exists.
    pub fn get_or_create_context_of(&self, flow: &str) -> Result<Arc<FlowContext>, CoreError> {
        if let Some(ctx) = self.context_of(flow) {
            return Ok(ctx);
        }
        let state = self.state_name();
        let created = self.machine()?.new_flow(flow, &state)?;
        Ok(created.context().clone())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Registers a handler for `name`.
    ///
    /// Fails if a non-empty handler is already registered under `name`.
    pub fn register_event(
        &self,
        name: impl Into<String>,
        handler: Option<EventHandler>,
    ) -> Result<(), CoreError> {
        let name = name.into();
        let mut events = self.events.lock();
        if let Some(Some(_)) = events.get(&name) {
            return Err(CoreError::EventRegistered { name });
        }
        events.insert(name, handler);
        Ok(())
    }

    pub fn unregister_event(&self, name: &str) {
        self.events.lock().remove(name);
    }

    /// Returns the handler registered under `name`.
    pub fn event_handler(&self, name: &str) -> Option<EventHandler> {
        self.events.lock().get(name).cloned().flatten()
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.lock().contains_key(name)
    }

    // =========================================================================
    // Transaction protocol
    // =========================================================================

    /// Opens a transaction.
    pub fn start_transaction(&self) -> Result<(), CoreError> {
        let mut control = self.control.lock();
        if control.committing {
            return Err(CoreError::Committing);
        }
        if control.action.is_some() {
            return Err(CoreError::TransactionOpen);
        }
        if !control.running {
            return Err(CoreError::NotRunning {
                flow: self.flow_name.clone(),
            });
        }
        control.action = Some(ContextAction::default());
        tracing::trace!(flow = %self.flow_name, "transaction started");
        Ok(())
    }

    /// Runs `f` against the open action under the control lock.
    fn stage<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut ContextAction) -> Result<(), CoreError>,
    {
        let mut control = self.control.lock();
        if control.committing {
            return Err(CoreError::Committing);
        }
        let action = control.action.as_mut().ok_or(CoreError::NoTransaction)?;
        f(action)
    }

    fn ensure_state(&self, state: &str) -> Result<(), CoreError> {
        if self.machine()?.has_state(state) {
            Ok(())
        } else {
            Err(CoreError::UnknownState {
                state: state.to_string(),
            })
        }
    }

    /// Stages a transition of this flow to `state`. A later call overwrites it.
    pub fn next(&self, state: &str) -> Result<(), CoreError> {
        self.stage(|action| {
            self.ensure_state(state)?;
            if action.stop {
                return Err(CoreError::AlreadyStopped);
            }
            action.next_state = Some(state.to_string());
            Ok(())
        })
    }

    /// Stages the start of an independent flow.
    pub fn start(&self, flow: &str, state: &str) -> Result<(), CoreError> {
        self.stage(|action| {
            self.ensure_state(state)?;
            action.starts.push(FlowAndState::new(flow, state));
            Ok(())
        })
    }

    /// Stages stopping this flow. Incompatible with a staged next state,
    /// parent resume or child start.
    pub fn stop(&self) -> Result<(), CoreError> {
        self.stage(|action| action.stage_stop())
    }

    /// Stages the start of a child flow. Implies [`stop`](Self::stop).
    pub fn child(&self, flow: &str, state: &str) -> Result<(), CoreError> {
        self.stage(|action| {
            self.ensure_state(state)?;
            if !action.stop {
                action.stage_stop()?;
            }
            action.children.push(FlowAndState::new(flow, state));
            Ok(())
        })
    }

    /// Stages resuming the parent flow at `state`. Implies
    /// [`stop`](Self::stop). Fails on root flows.
    pub fn parent(&self, state: &str) -> Result<(), CoreError> {
        let is_root = self.is_root();
        self.stage(|action| {
            if is_root {
                return Err(CoreError::RootContext {
                    flow: self.flow_name.clone(),
                });
            }
            self.ensure_state(state)?;
            if !action.stop {
                action.stage_stop()?;
            }
            action.parent = Some(state.to_string());
            Ok(())
        })
    }

    /// Applies the staged action.
    ///
    /// Staging calls and rollback are rejected while the commit runs. The next
    /// state, if any, is entered after the action has been cleared.
    pub fn commit(self: &Arc<Self>) -> Result<(), CoreError> {
        let action = {
            let mut control = self.control.lock();
            let action = control.action.clone().ok_or(CoreError::NoTransaction)?;
            control.committing = true;
            action
        };

        let machine = match self.machine() {
            Ok(machine) => machine,
            Err(e) => {
                self.finish_commit();
                return Err(e);
            }
        };

        tracing::debug!(flow = %self.flow_name, ?action, "committing");

        if action.stop {
            self.halt();
        }

        // Forked flows are created in order here but launched, like the parent
        // resume, only once this commit has finished; a child resuming us must
        // not see `committing`. Launch order still follows the phase order.
        let mut launches = Vec::with_capacity(action.starts.len() + action.children.len());

        for start in &action.starts {
            match machine.new_flow(&start.flow, &start.state) {
                Ok(flow) => launches.push(flow.context().clone()),
                Err(e) => self.diagnostics().error(&start.flow, "start", &e),
            }
        }

        for child in &action.children {
            match machine.new_child_flow(self, &child.flow, &child.state) {
                Ok(flow) => launches.push(flow.context().clone()),
                Err(e) => self.diagnostics().error(&child.flow, "child", &e),
            }
        }

        self.finish_commit();

        for ctx in launches {
            machine.spawn_run(ctx);
        }

        if let Some(target) = &action.parent {
            if let Some(parent) = self.parent_flow() {
                let parent_ctx = parent.context();
                if !parent_ctx.is_running() {
                    parent_ctx.run_next_state(target);
                }
            }
        }

        if let Some(next) = &action.next_state {
            self.run_next_state(next);
        }

        Ok(())
    }

    fn finish_commit(&self) {
        let mut control = self.control.lock();
        control.action = None;
        control.committing = false;
    }

    /// Discards the open transaction. No-op while committing.
    pub fn rollback(&self) {
        let mut control = self.control.lock();
        if control.committing {
            return;
        }
        if control.action.take().is_some() {
            tracing::trace!(flow = %self.flow_name, "transaction rolled back");
        }
    }

    /// Runs `f` inside a transaction.
    ///
    /// On failure the transaction is rolled back and the error returned. On
    /// success the commit is launched as its own task; this call does not wait
    /// for the side effects.
    pub fn transaction<F>(self: &Arc<Self>, f: F) -> Result<(), CoreError>
    where
        F: FnOnce() -> Result<(), CallbackError>,
    {
        self.start_transaction()?;

        if let Err(e) = f() {
            self.rollback();
            return Err(CoreError::Aborted(e));
        }

        let machine = match self.machine() {
            Ok(machine) => machine,
            Err(e) => {
                self.rollback();
                return Err(e);
            }
        };

        let ctx = self.clone();
        machine.spawn("commit", &self.flow_name, async move {
            if let Err(e) = ctx.commit() {
                ctx.diagnostics().error(&ctx.flow_name, "commit", &e);
            }
        });

        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Enters the current state: runs enter then ready inside a transaction.
    /// No-op if already running.
    pub fn run(self: &Arc<Self>) {
        {
            let mut control = self.control.lock();
            if control.running {
                return;
            }
            control.running = true;
        }

        let state = self.current_state();
        self.flow_storage().write().record_visit(state.name.clone());
        self.diagnostics()
            .info(&self.flow_name, &format!("entering state {}", state.name));

        if let Err(e) = self.transaction(|| state.enter(self)) {
            tracing::debug!(
                flow = %self.flow_name,
                state = %state.name,
                error = %e,
                "state entry aborted"
            );
        }
    }

    /// Stops the flow and runs its exit phase as a separate task.
    /// No-op while committing or when not running.
    pub fn kill(self: &Arc<Self>) {
        {
            let mut control = self.control.lock();
            if control.committing || !control.running {
                return;
            }
            control.running = false;
        }
        self.spawn_exit();
    }

    /// Drops any commit in progress and any open transaction, then kills.
    pub fn force_kill(self: &Arc<Self>) {
        {
            let mut control = self.control.lock();
            control.committing = false;
            control.action = None;
        }
        self.kill();
    }

    /// Stop applied by a commit, which holds the committing flag itself.
    fn halt(self: &Arc<Self>) {
        {
            let mut control = self.control.lock();
            if !control.running {
                return;
            }
            control.running = false;
        }
        self.spawn_exit();
    }

    /// Runs the exit phase of the state bound right now, even if the flow is
    /// rebound before the task gets to run.
    fn spawn_exit(self: &Arc<Self>) {
        let state = self.current_state();
        self.diagnostics()
            .info(&self.flow_name, &format!("stopping flow in state {}", state.name));
        match self.machine() {
            Ok(machine) => {
                let ctx = self.clone();
                machine.spawn("exit", &self.flow_name, async move {
                    ctx.exit_state(&state)
                });
            }
            Err(_) => self.exit_state(&state),
        }
    }

    fn exit_state(self: &Arc<Self>, state: &StateDefinition) {
        if let Err(e) = state.exit(self) {
            tracing::debug!(
                flow = %self.flow_name,
                state = %state.name,
                error = %e,
                "exit failed"
            );
        }
    }

    /// Leaves the current state and enters `next`.
    ///
    /// The exit phase runs here, before rebinding, if the flow was running.
    /// If rebinding fails the flow is reported and killed.
    pub fn run_next_state(self: &Arc<Self>, next: &str) {
        let was_running = std::mem::replace(&mut self.control.lock().running, false);
        if was_running {
            self.exit_state(&self.current_state());
        }

        let machine = match self.machine() {
            Ok(machine) => machine,
            Err(e) => {
                self.diagnostics().error(&self.flow_name, "next", &e);
                return;
            }
        };

        match machine.new_flow(&self.flow_name, next) {
            Ok(flow) => {
                machine
                    .diagnostics()
                    .info(&self.flow_name, &format!("transitioning to {}", next));
                machine.spawn_run(flow.context().clone());
            }
            Err(e) => {
                self.diagnostics().error(&self.flow_name, "next", &e);
                self.control.lock().running = true;
                self.kill();
            }
        }
    }
}

impl fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = self.control.lock();
        f.debug_struct("FlowContext")
            .field("flow", &self.flow_name)
            .field("state", &self.bindings.read().state.name)
            .field("running", &control.running)
            .field("committing", &control.committing)
            .field("action", &control.action)
            .finish()
    }
}
