//! Flows: named, possibly hierarchical execution units.

use crate::context::{Bindings, FlowContext};
use crate::definition::StateDefinition;
use crate::machine::Machine;
use crate::storage::StorageRef;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Local storages of a flow keyed by state name. Child flows share their
/// parent's map.
pub type LocalStorages = Arc<Mutex<HashMap<String, StorageRef>>>;

struct FlowScopes {
    flow: StorageRef,
    locals: LocalStorages,
}

/// A named instance of the state machine.
///
/// Flows stay registered in their machine once created; a stopped flow is
/// idle until the factory rebinds it.
pub struct Flow {
    name: String,
    machine: Weak<Machine>,
    context: Arc<FlowContext>,
    scopes: Mutex<FlowScopes>,
    pending_events: Mutex<HashMap<String, Vec<Value>>>,
    history_limit: usize,
}

impl Flow {
    /// Creates a flow bound to `state` with fresh flow, local and context
    /// storages.
    pub(crate) fn new(
        name: &str,
        machine: Weak<Machine>,
        state: Arc<StateDefinition>,
        state_storage: StorageRef,
        global: StorageRef,
        history_limit: usize,
    ) -> Arc<Self> {
        let flow_storage = StorageRef::with_history_limit(history_limit);
        let local = StorageRef::with_history_limit(history_limit);
        let context = StorageRef::with_history_limit(history_limit);

        let mut locals = HashMap::new();
        locals.insert(state.name.clone(), local.clone());

        Arc::new_cyclic(|me| {
            let bindings = Bindings {
                state,
                global,
                state_storage,
                flow: flow_storage.clone(),
                local,
                context,
                parent: None,
            };

            Flow {
                name: name.to_string(),
                machine: machine.clone(),
                context: Arc::new(FlowContext::new(
                    name.to_string(),
                    me.clone(),
                    machine,
                    bindings,
                )),
                scopes: Mutex::new(FlowScopes {
                    flow: flow_storage,
                    locals: Arc::new(Mutex::new(locals)),
                }),
                pending_events: Mutex::new(HashMap::new()),
                history_limit,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<FlowContext> {
        &self.context
    }

    pub fn machine(&self) -> Option<Arc<Machine>> {
        self.machine.upgrade()
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    /// Returns the flow storage, shared with child flows.
    pub fn flow_storage(&self) -> StorageRef {
        self.scopes.lock().flow.clone()
    }

    /// Returns the local storage kept for `state`, if the flow has been there.
    pub fn local_storage(&self, state: &str) -> Option<StorageRef> {
        let locals = self.scopes.lock().locals.clone();
        let locals = locals.lock();
        locals.get(state).cloned()
    }

    pub(crate) fn local_storages(&self) -> LocalStorages {
        self.scopes.lock().locals.clone()
    }

    /// Returns the local storage for `state`, creating it on first use.
    pub(crate) fn local_for(&self, state: &str) -> StorageRef {
        let locals = self.local_storages();
        let mut locals = locals.lock();
        locals
            .entry(state.to_string())
            .or_insert_with(|| StorageRef::with_history_limit(self.history_limit))
            .clone()
    }

    /// Replaces this flow's flow storage and local map with shared ones.
    pub(crate) fn share_scopes(&self, flow: StorageRef, locals: LocalStorages) {
        let mut scopes = self.scopes.lock();
        scopes.flow = flow;
        scopes.locals = locals;
    }

    /// Buffers an event payload for `name`.
    pub fn queue_event(&self, name: impl Into<String>, payload: Value) {
        self.pending_events
            .lock()
            .entry(name.into())
            .or_default()
            .push(payload);
    }

    /// Drains the buffered payloads for `name`, oldest first.
    pub fn take_pending_events(&self, name: &str) -> Vec<Value> {
        self.pending_events.lock().remove(name).unwrap_or_default()
    }

    pub fn pending_event_count(&self, name: &str) -> usize {
        self.pending_events
            .lock()
            .get(name)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Stops the flow outside the transaction protocol.
    pub fn stop(&self) {
        self.context.force_kill();
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
