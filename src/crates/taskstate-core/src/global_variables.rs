//! Global variable store: an out-of-band channel shared by execution logic.
//!
//! Values written here are not part of the data flow graph. The store must be safe
//! for concurrent access from every running state.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe key/value store used by state logic
pub trait GlobalVariableStore: Send + Sync {
    /// Get a value by name
    fn get(&self, name: &str) -> Option<Value>;

    /// Store a value, replacing any previous one
    fn set(&self, name: &str, value: Value);

    /// Delete a value, returning whether it existed
    fn delete(&self, name: &str) -> bool;

    /// Check if a value exists
    fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All variable names, sorted
    fn keys(&self) -> Vec<String>;
}

/// In-memory [`GlobalVariableStore`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryGlobalVariables {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl InMemoryGlobalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl GlobalVariableStore for InMemoryGlobalVariables {
    fn get(&self, name: &str) -> Option<Value> {
        self.data.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: Value) {
        self.data.write().insert(name.to_string(), value);
    }

    fn delete(&self, name: &str) -> bool {
        self.data.write().remove(name).is_some()
    }

    fn exists(&self, name: &str) -> bool {
        self.data.read().contains_key(name)
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let store = InMemoryGlobalVariables::new();
        assert!(store.is_empty());

        store.set("counter", json!(1));
        store.set("name", json!("robot"));
        assert_eq!(store.get("counter"), Some(json!(1)));
        assert!(store.exists("name"));
        assert_eq!(store.keys(), vec!["counter".to_string(), "name".to_string()]);

        assert!(store.delete("counter"));
        assert!(!store.delete("counter"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let store = InMemoryGlobalVariables::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.set(&format!("v{}", i), json!(i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
