//! Durable key-value storage for session state
//!
//! ~/.local/share/nowplaying/storage/     # FileStore default location
//! └── {key}.json                         # One JSON document per storage key
//!
//! The session only needs get/set/remove by key, so tests swap in
//! `MemoryStore` where the binary uses `FileStore`.

mod file;

pub use file::FileStore;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Synchronous key-value storage, shaped like browser local storage
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key` if present
    fn remove(&self, key: &str) -> Result<()>;

    /// Identifies the backing storage; handles that share contents return the same value
    fn location(&self) -> String;
}

/// In-memory store; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Memory store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    fn location(&self) -> String {
        format!("memory:{:p}", Arc::as_ptr(&self.entries))
    }
}

/// Read and parse a JSON document, treating unparseable content as absent
pub fn get_json(store: &dyn KeyValueStore, key: &str) -> Result<Option<serde_json::Value>> {
    let Some(raw) = store
        .get(key)
        .with_context(|| format!("Failed to read storage key '{}'", key))?
    else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!("Ignoring unparseable data under storage key '{}': {}", key, e);
            Ok(None)
        }
    }
}

/// Serialize and store a JSON document
pub fn set_json(store: &dyn KeyValueStore, key: &str, value: &serde_json::Value) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store
        .set(key, &raw)
        .with_context(|| format!("Failed to write storage key '{}'", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store_location_follows_contents() {
        let store = MemoryStore::new();
        assert_eq!(store.location(), store.clone().location());
        assert_ne!(store.location(), MemoryStore::new().location());
    }

    #[test]
    fn test_memory_store_clones_share_contents() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", "v").unwrap();
        assert_eq!(other.get("k").unwrap().as_deref(), Some("v"));

        other.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_json_helpers() {
        let store = MemoryStore::new();
        set_json(&store, "doc", &json!({"a": 1})).unwrap();
        assert_eq!(get_json(&store, "doc").unwrap(), Some(json!({"a": 1})));

        store.set("broken", "{not json").unwrap();
        assert!(get_json(&store, "broken").unwrap().is_none());
        assert!(get_json(&store, "missing").unwrap().is_none());
    }
}
