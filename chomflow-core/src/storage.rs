//! Scoped key/value storage.
//!
//! Each storage has a persistent section (JSON values, snapshotted into history)
//! and a transient section (arbitrary values, never serialized). Flows reach a
//! storage through a [`StorageRef`], which is shared, never copied, between the
//! flows that see the same scope.

use crate::error::CoreError;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Persistent section of a storage.
pub type PersistentMap = HashMap<String, Value>;

/// The five storage scopes visible from a flow context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Shared by every flow in the machine.
    Global,
    /// Shared by every flow in the same state.
    State,
    /// Shared by a flow and its child flows.
    Flow,
    /// Kept per (flow, state) across re-entries.
    Local,
    /// Private to the current state occupancy; cleared on every rebinding.
    Context,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::State => "state",
            Scope::Flow => "flow",
            Scope::Local => "local",
            Scope::Context => "context",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scoped key/value container.
#[derive(Default)]
pub struct Storage {
    persistent: PersistentMap,
    transient: HashMap<String, Arc<dyn Any + Send + Sync>>,
    history: Vec<PersistentMap>,
    visited_states: Vec<String>,
    /// Maximum number of snapshots kept (0 = unlimited).
    history_limit: usize,
}

impl Storage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty storage that keeps at most `limit` snapshots.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            history_limit: limit,
            ..Self::default()
        }
    }

    // =========================================================================
    // Persistent section
    // =========================================================================

    /// Returns the raw persistent value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.persistent.get(key)
    }

    /// Returns the persistent value for `key` decoded as `T`.
    ///
    /// Absence and type mismatch both yield `None`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.persistent
            .get(key)
            .and_then(|v| T::deserialize(v).ok())
    }

    /// Stores a serializable value in the persistent section.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), CoreError> {
        let value = serde_json::to_value(value)?;
        self.persistent.insert(key.into(), value);
        Ok(())
    }

    /// Stores a raw JSON value in the persistent section.
    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.persistent.insert(key.into(), value);
    }

    /// Removes a persistent entry.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.persistent.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.persistent.contains_key(key)
    }

    /// Returns the persistent section.
    pub fn persistent(&self) -> &PersistentMap {
        &self.persistent
    }

    // =========================================================================
    // Transient section
    // =========================================================================

    /// Returns the transient value for `key` if it holds a `T`.
    pub fn get_transient<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.transient
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Stores an arbitrary value in the transient section.
    pub fn set_transient<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.transient.insert(key.into(), Arc::new(value));
    }

    /// Removes a transient entry, returning it if it held a `T`.
    pub fn take_transient<T: Any + Send + Sync>(&mut self, key: &str) -> Option<Arc<T>> {
        self.transient
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub fn contains_transient(&self, key: &str) -> bool {
        self.transient.contains_key(key)
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Appends a deep copy of the persistent section to the history.
    ///
    /// The copy goes through a serialize/deserialize round trip, so only
    /// serializable content survives.
    pub fn snapshot(&mut self) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&self.persistent)?;
        let clone: PersistentMap = serde_json::from_slice(&bytes)?;

        if self.history_limit > 0 && self.history.len() >= self.history_limit {
            let excess = self.history.len() + 1 - self.history_limit;
            self.history.drain(..excess);
        }
        self.history.push(clone);

        Ok(())
    }

    /// Returns the snapshot history, oldest first.
    pub fn history(&self) -> &[PersistentMap] {
        &self.history
    }

    /// Records that a flow entered `state` while bound to this storage.
    pub fn record_visit(&mut self, state: impl Into<String>) {
        self.visited_states.push(state.into());
    }

    /// Returns the visited state names, oldest first.
    pub fn visited_states(&self) -> &[String] {
        &self.visited_states
    }

    /// Replaces both sections with fresh, empty maps.
    ///
    /// History and visited states are kept.
    pub fn clear(&mut self) {
        self.persistent = HashMap::new();
        self.transient = HashMap::new();
    }

    pub fn is_empty(&self) -> bool {
        self.persistent.is_empty() && self.transient.is_empty()
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut transient: Vec<&String> = self.transient.keys().collect();
        transient.sort();
        f.debug_struct("Storage")
            .field("persistent", &self.persistent)
            .field("transient", &transient)
            .field("history", &self.history.len())
            .field("visited_states", &self.visited_states)
            .finish()
    }
}

/// Shared handle to a [`Storage`].
///
/// Cloning the handle aliases the storage; use [`StorageRef::ptr_eq`] to test
/// identity.
#[derive(Clone, Default)]
pub struct StorageRef(Arc<RwLock<Storage>>);

impl StorageRef {
    /// Creates a handle to a fresh, empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(limit: usize) -> Self {
        Self(Arc::new(RwLock::new(Storage::with_history_limit(limit))))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.0.write()
    }

    /// Returns true if both handles point at the same storage.
    pub fn ptr_eq(&self, other: &StorageRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Shorthand for `read().get_as(key)`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.read().get_as(key)
    }

    /// Shorthand for `write().set(key, value)`.
    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: T) -> Result<(), CoreError> {
        self.write().set(key, value)
    }
}

impl fmt::Debug for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.read(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_typed_get_set() {
        let mut storage = Storage::new();
        storage.set("count", 3u32).unwrap();
        storage.set("name", "alpha").unwrap();

        assert_eq!(storage.get_as::<u32>("count"), Some(3));
        assert_eq!(storage.get_as::<String>("name"), Some("alpha".to_string()));
        // Mismatch and absence both read as None
        assert_eq!(storage.get_as::<u32>("name"), None);
        assert_eq!(storage.get_as::<u32>("missing"), None);
        assert_eq!(storage.get("count"), Some(&json!(3)));
    }

    #[test]
    fn test_transient_downcast() {
        struct Handle(u8);

        let mut storage = Storage::new();
        storage.set_transient("handle", Handle(7));

        assert_eq!(storage.get_transient::<Handle>("handle").unwrap().0, 7);
        assert!(storage.get_transient::<String>("handle").is_none());
        assert!(storage.take_transient::<Handle>("handle").is_some());
        assert!(!storage.contains_transient("handle"));
    }

    #[test]
    fn test_snapshot_deep_copies() {
        let mut storage = Storage::new();
        storage.set("items", vec![1, 2]).unwrap();
        storage.snapshot().unwrap();

        storage.set("items", vec![1, 2, 3]).unwrap();
        storage.snapshot().unwrap();

        assert_eq!(storage.history().len(), 2);
        assert_eq!(storage.history()[0]["items"], json!([1, 2]));
        assert_eq!(storage.history()[1]["items"], json!([1, 2, 3]));
    }

    #[test]
    fn test_snapshot_ignores_transient() {
        let mut storage = Storage::new();
        storage.set_transient("scratch", 42u64);
        storage.snapshot().unwrap();
        assert!(storage.history()[0].is_empty());
    }

    #[test]
    fn test_history_limit() {
        let mut storage = Storage::with_history_limit(2);
        for i in 0..5 {
            storage.set("i", i).unwrap();
            storage.snapshot().unwrap();
        }
        assert_eq!(storage.history().len(), 2);
        assert_eq!(storage.history()[0]["i"], json!(3));
        assert_eq!(storage.history()[1]["i"], json!(4));
    }

    #[test]
    fn test_clear_keeps_history() {
        let mut storage = Storage::new();
        storage.set("a", 1).unwrap();
        storage.set_transient("b", 2u8);
        storage.snapshot().unwrap();
        storage.record_visit("start");

        storage.clear();

        assert!(storage.is_empty());
        assert_eq!(storage.history().len(), 1);
        assert_eq!(storage.visited_states(), ["start".to_string()]);
    }

    #[test]
    fn test_storage_ref_aliasing() {
        let a = StorageRef::new();
        let b = a.clone();
        let c = StorageRef::new();

        b.set("shared", true).unwrap();

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.get_as::<bool>("shared"), Some(true));
        assert_eq!(c.get_as::<bool>("shared"), None);
    }

    proptest! {
        #[test]
        fn prop_snapshot_matches_persistent(entries in prop::collection::hash_map("[a-z]{1,8}", any::<i64>(), 0..16)) {
            let mut storage = Storage::new();
            for (k, v) in &entries {
                storage.set(k.clone(), *v).unwrap();
            }
            storage.snapshot().unwrap();

            let snap = &storage.history()[0];
            prop_assert_eq!(snap.len(), entries.len());
            for (k, v) in &entries {
                prop_assert_eq!(&snap[k], &json!(v));
            }
        }
    }
}
