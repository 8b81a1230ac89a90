//! Property store with change tracking.
//!
//! Values and the set of changed values live behind separate read/write locks.
//! Reads are the common case; writers only hold a lock for a map insert.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-module property values plus the ones changed since the last flush.
#[derive(Debug, Default)]
pub struct PropertyStore {
    values: RwLock<HashMap<String, Value>>,
    changed: RwLock<HashMap<String, Value>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property value and mark it changed. Returns the previous value.
    pub fn update_property(&self, name: &str, value: Value) -> Option<Value> {
        let previous = {
            let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
            values.insert(name.to_string(), value.clone())
        };
        let mut changed = self.changed.write().unwrap_or_else(|e| e.into_inner());
        changed.insert(name.to_string(), value);
        previous
    }

    /// Get the current value of a property.
    pub fn read_property(&self, name: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(name).cloned()
    }

    /// Get the values of the named properties. Unknown names are skipped.
    pub fn read_properties(&self, names: &[String]) -> HashMap<String, Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        names
            .iter()
            .filter_map(|n| values.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    }

    /// Snapshot of every property.
    pub fn read_all_properties(&self) -> HashMap<String, Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.clone()
    }

    /// Take the properties changed since the previous call.
    pub fn read_changed_properties(&self) -> HashMap<String, Value> {
        let mut changed = self.changed.write().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *changed)
    }

    /// Remove a property. Returns its last value.
    pub fn remove_property(&self, name: &str) -> Option<Value> {
        self.changed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(name)
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
