//! Where a session keeps its record inside the shared storage key
//!
//! Without a provider name the record is the whole document. With one, the
//! document is an object of `{ <provider>: <record> }` shared by every
//! provider configured against the same key.
//!
//! Nothing coordinates writers across processes; two sessions writing the
//! same key interleave and the last write wins.

use super::types::SessionRecord;
use crate::storage::{get_json, set_json, KeyValueStore};
use anyhow::Result;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateSlot {
    Flat { key: String },
    Nested { key: String, provider: String },
}

impl StateSlot {
    pub fn resolve(storage_key: &str, provider_name: Option<&str>) -> Self {
        match provider_name.filter(|name| !name.is_empty()) {
            Some(provider) => StateSlot::Nested {
                key: storage_key.to_string(),
                provider: provider.to_string(),
            },
            None => StateSlot::Flat {
                key: storage_key.to_string(),
            },
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StateSlot::Flat { key } | StateSlot::Nested { key, .. } => key,
        }
    }

    /// Record stored for this session, if any
    pub fn load(&self, store: &dyn KeyValueStore) -> Result<Option<SessionRecord>> {
        let Some(document) = get_json(store, self.key())? else {
            return Ok(None);
        };

        let record = match self {
            StateSlot::Flat { .. } => Some(document),
            StateSlot::Nested { provider, .. } => document.get(provider).cloned(),
        };

        Ok(record.and_then(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Ignoring unrecognized session record in '{}': {}", self.key(), e);
                None
            }
        }))
    }

    /// Replace this session's record, keeping sibling providers intact
    pub fn save(&self, store: &dyn KeyValueStore, record: &SessionRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        match self {
            StateSlot::Flat { key } => set_json(store, key, &value),
            StateSlot::Nested { key, provider } => {
                let mut document = match get_json(store, key)? {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                document.insert(provider.clone(), value);
                set_json(store, key, &Value::Object(document))
            }
        }
    }

    /// Drop this session's record
    pub fn clear(&self, store: &dyn KeyValueStore) -> Result<()> {
        match self {
            StateSlot::Flat { key } => store.remove(key),
            StateSlot::Nested { key, provider } => {
                let Some(Value::Object(mut document)) = get_json(store, key)? else {
                    return Ok(());
                };
                if document.remove(provider).is_none() {
                    return Ok(());
                }
                if document.is_empty() {
                    store.remove(key)
                } else {
                    set_json(store, key, &Value::Object(document))
                }
            }
        }
    }
}
