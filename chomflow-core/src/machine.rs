//! Machine: state catalogue, shared storages and the live flow table.

use crate::context::FlowContext;
use crate::definition::StateDefinition;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::CoreError;
use crate::flow::Flow;
use crate::storage::StorageRef;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

/// Input for [`Machine::new`].
pub struct MachineDefinition {
    /// Machine name.
    pub name: String,

    /// Name of the flow started on construction.
    pub initial_flow: String,

    /// State the initial flow starts in.
    pub initial_state: String,

    /// State definitions keyed by state name.
    pub states: HashMap<String, Arc<StateDefinition>>,

    diagnostics: Option<Arc<dyn DiagnosticSink>>,
    history_limit: usize,
}

impl MachineDefinition {
    pub fn new(
        name: impl Into<String>,
        initial_flow: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            initial_flow: initial_flow.into(),
            initial_state: initial_state.into(),
            states: HashMap::new(),
            diagnostics: None,
            history_limit: 0,
        }
    }

    /// Adds a state under its own name.
    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.insert(state.name.clone(), Arc::new(state));
        self
    }

    /// Routes engine diagnostics to `sink` instead of `tracing`.
    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Caps the snapshot history of every storage (0 = unlimited).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// Registry of states and flows.
pub struct Machine {
    name: String,
    global: StorageRef,
    states: HashMap<String, Arc<StateDefinition>>,
    state_storages: HashMap<String, StorageRef>,
    flows: DashMap<String, Arc<Flow>>,
    diagnostics: Arc<dyn DiagnosticSink>,
    runtime: Handle,
    history_limit: usize,
    me: Weak<Machine>,
}

impl Machine {
    /// Builds a machine and launches its initial flow.
    ///
    /// Must be called from within a tokio runtime; every flow task is spawned
    /// on that runtime.
    pub fn new(definition: MachineDefinition) -> Result<Arc<Self>, CoreError> {
        if !definition.states.contains_key(&definition.initial_state) {
            return Err(CoreError::InitialStateNotFound {
                state: definition.initial_state,
            });
        }

        let runtime = Handle::try_current().map_err(|_| CoreError::NoRuntime)?;
        let history_limit = definition.history_limit;

        let state_storages = definition
            .states
            .keys()
            .map(|name| (name.clone(), StorageRef::with_history_limit(history_limit)))
            .collect();

        let machine = Arc::new_cyclic(|me| Machine {
            name: definition.name,
            global: StorageRef::with_history_limit(history_limit),
            states: definition.states,
            state_storages,
            flows: DashMap::new(),
            diagnostics: definition
                .diagnostics
                .unwrap_or_else(|| Arc::new(TracingSink)),
            runtime,
            history_limit,
            me: me.clone(),
        });

        let flow = machine.new_flow(&definition.initial_flow, &definition.initial_state)?;

        machine.diagnostics.info(
            &definition.initial_flow,
            &format!(
                "machine {} started at state {}",
                machine.name, definition.initial_state
            ),
        );

        machine.spawn_run(flow.context().clone());

        Ok(machine)
    }

    // =========================================================================
    // Flow factory
    // =========================================================================

    /// Creates flow `name` at `state`, or rebinds it if it already exists.
    ///
    /// Rebinding keeps the flow's identity, reuses its local storage for
    /// `state`, swaps in the state storage and clears the context storage. It
    /// fails if the existing flow is running.
    pub fn new_flow(&self, name: &str, state: &str) -> Result<Arc<Flow>, CoreError> {
        let (definition, state_storage) = self.lookup(state)?;

        match self.flows.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let flow = entry.get().clone();
                if flow.is_running() {
                    return Err(CoreError::FlowRunning {
                        flow: name.to_string(),
                    });
                }

                let local = flow.local_for(state);
                flow.context().rebind(definition, state_storage, local);
                tracing::debug!(flow = name, state, "flow rebound");
                Ok(flow)
            }
            Entry::Vacant(entry) => {
                let flow = Flow::new(
                    name,
                    self.me.clone(),
                    definition,
                    state_storage,
                    self.global.clone(),
                    self.history_limit,
                );
                entry.insert(flow.clone());
                tracing::debug!(flow = name, state, "flow created");
                Ok(flow)
            }
        }
    }

    /// Creates or rebinds the child flow `<parent>:<name>` at `state`.
    ///
    /// The child shares the parent's flow storage and its whole local-storage
    /// map, so a state name used by both resolves to the same local storage.
    pub fn new_child_flow(
        &self,
        parent: &FlowContext,
        name: &str,
        state: &str,
    ) -> Result<Arc<Flow>, CoreError> {
        let parent_flow = parent.flow().ok_or_else(|| CoreError::FlowDropped {
            flow: parent.flow_name().to_string(),
        })?;

        let child_name = format!("{}:{}", parent.flow_name(), name);
        let flow = self.new_flow(&child_name, state)?;

        let flow_storage = parent_flow.flow_storage();
        flow.share_scopes(flow_storage.clone(), parent_flow.local_storages());
        let local = flow.local_for(state);
        flow.context().adopt(parent_flow, flow_storage, local);

        Ok(flow)
    }

    fn lookup(&self, state: &str) -> Result<(Arc<StateDefinition>, StorageRef), CoreError> {
        match (self.states.get(state), self.state_storages.get(state)) {
            (Some(definition), Some(storage)) => Ok((definition.clone(), storage.clone())),
            _ => Err(CoreError::UnknownState {
                state: state.to_string(),
            }),
        }
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Spawns `future` on the machine's runtime. A panic inside the task is
    /// reported to the diagnostic sink instead of being lost.
    pub(crate) fn spawn<F>(&self, task: &'static str, flow: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(future);
        let diagnostics = self.diagnostics.clone();
        let flow = flow.to_string();
        self.runtime.spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    diagnostics.error(&flow, task, &e);
                }
            }
        });
    }

    /// Launches the run loop of `ctx` as its own task.
    pub(crate) fn spawn_run(&self, ctx: Arc<FlowContext>) {
        let flow = ctx.flow_name().to_string();
        self.spawn("run", &flow, async move { ctx.run() });
    }

    /// Force-kills every flow.
    pub fn shutdown(&self) {
        tracing::info!(machine = %self.name, flows = self.flows.len(), "shutting down");
        let flows: Vec<Arc<Flow>> = self.flows.iter().map(|r| r.value().clone()).collect();
        for flow in flows {
            flow.stop();
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the flow registered under `name`.
    pub fn flow(&self, name: &str) -> Option<Arc<Flow>> {
        self.flows.get(name).map(|r| r.value().clone())
    }

    /// Returns all registered flow names, sorted.
    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn state_definition(&self, name: &str) -> Option<Arc<StateDefinition>> {
        self.states.get(name).cloned()
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    /// Returns all state names, sorted.
    pub fn state_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.states.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn global_storage(&self) -> StorageRef {
        self.global.clone()
    }

    pub fn state_storage(&self, state: &str) -> Option<StorageRef> {
        self.state_storages.get(state).cloned()
    }

    pub fn diagnostics(&self) -> Arc<dyn DiagnosticSink> {
        self.diagnostics.clone()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("states", &self.state_names())
            .field("flows", &self.flow_names())
            .finish_non_exhaustive()
    }
}
