pub mod state_file;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("capability rejected: {0}")]
    Rejected(String),

    #[error("persisted state unavailable: {0}")]
    Persistence(String),
}

/// Declared value type of a capability, fixed when the mapping table is
/// written instead of being guessed from the currently stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Number,
    Text,
    Boolean,
}

impl ValueKind {
    /// Coerce an incoming value to the declared type. Returns `None` when
    /// the value can not be represented as the declared type.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match self {
            ValueKind::Number => match value {
                Value::Number(_) => Some(value.clone()),
                Value::String(s) => s.trim().parse::<f64>().ok().map(|v| json!(v)),
                Value::Bool(b) => Some(json!(if *b { 1.0 } else { 0.0 })),
                _ => None,
            },
            ValueKind::Text => match value {
                Value::String(_) => Some(value.clone()),
                Value::Number(n) => Some(json!(n.to_string())),
                Value::Bool(b) => Some(json!(b.to_string())),
                _ => None,
            },
            ValueKind::Boolean => match value {
                Value::Bool(b) => Some(json!(*b)),
                Value::String(s) => Some(json!(s == "true" || s == "1")),
                Value::Number(n) => Some(json!(n.as_f64() == Some(1.0))),
                _ => None,
            },
        }
    }
}

/// Host side of the meter core. The poller never touches platform state
/// directly; it talks to whatever store the caller injected. Production
/// wires the MQTT-backed store, tests an in-memory one.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    async fn has_capability(&self, name: &str) -> bool;

    /// Register a capability. Registering an already known name is a no-op.
    async fn add_capability(&self, name: &str, kind: ValueKind) -> Result<(), StoreError>;

    async fn capability_value(&self, name: &str) -> Option<Value>;

    async fn set_capability_value(&self, name: &str, value: Value) -> Result<(), StoreError>;

    /// Read a persisted per-meter value, `None` when never written or cleared.
    async fn store_value(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write (`Some`) or clear (`None`) a persisted per-meter value.
    async fn set_store_value(&self, key: &str, value: Option<Value>) -> Result<(), StoreError>;
}

/// Plain in-memory store, the test double for the host platform.
pub struct MemoryStore {
    capabilities: RwLock<HashMap<String, ValueKind>>,
    values: RwLock<HashMap<String, Value>>,
    persisted: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            capabilities: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            persisted: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityStore for MemoryStore {
    async fn has_capability(&self, name: &str) -> bool {
        self.capabilities.read().await.contains_key(name)
    }

    async fn add_capability(&self, name: &str, kind: ValueKind) -> Result<(), StoreError> {
        self.capabilities.write().await.entry(name.to_string()).or_insert(kind);
        Ok(())
    }

    async fn capability_value(&self, name: &str) -> Option<Value> {
        self.values.read().await.get(name).cloned()
    }

    async fn set_capability_value(&self, name: &str, value: Value) -> Result<(), StoreError> {
        self.values.write().await.insert(name.to_string(), value);
        Ok(())
    }

    async fn store_value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.persisted.read().await.get(key).cloned())
    }

    async fn set_store_value(&self, key: &str, value: Option<Value>) -> Result<(), StoreError> {
        let mut persisted = self.persisted.write().await;
        match value {
            Some(v) => {
                persisted.insert(key.to_string(), v);
            }
            None => {
                persisted.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_number() {
        assert_eq!(ValueKind::Number.coerce(&json!(42.5)), Some(json!(42.5)));
        assert_eq!(ValueKind::Number.coerce(&json!("12.25")), Some(json!(12.25)));
        assert_eq!(ValueKind::Number.coerce(&json!(true)), Some(json!(1.0)));
        assert_eq!(ValueKind::Number.coerce(&json!("not a number")), None);
    }

    #[test]
    fn test_coerce_boolean() {
        assert_eq!(ValueKind::Boolean.coerce(&json!("true")), Some(json!(true)));
        assert_eq!(ValueKind::Boolean.coerce(&json!(1.0)), Some(json!(true)));
        assert_eq!(ValueKind::Boolean.coerce(&json!(0.0)), Some(json!(false)));
        assert_eq!(ValueKind::Boolean.coerce(&json!("off")), Some(json!(false)));
    }

    #[tokio::test]
    async fn test_memory_store_capabilities() {
        let store = MemoryStore::new();
        assert!(!store.has_capability("voltage_l1").await);

        store.add_capability("voltage_l1", ValueKind::Number).await.unwrap();
        assert!(store.has_capability("voltage_l1").await);

        // registering twice keeps the first kind and does not fail
        store.add_capability("voltage_l1", ValueKind::Text).await.unwrap();
        assert_eq!(store.capabilities.read().await.get("voltage_l1"), Some(&ValueKind::Number));

        store.set_capability_value("voltage_l1", json!(230.1)).await.unwrap();
        assert_eq!(store.capability_value("voltage_l1").await, Some(json!(230.1)));
    }

    #[tokio::test]
    async fn test_memory_store_persisted_values() {
        let store = MemoryStore::new();
        assert_eq!(store.store_value("daily_import_baseline").await.unwrap(), None);

        store.set_store_value("daily_import_baseline", Some(json!(120.5))).await.unwrap();
        assert_eq!(store.store_value("daily_import_baseline").await.unwrap(), Some(json!(120.5)));

        store.set_store_value("daily_import_baseline", None).await.unwrap();
        assert_eq!(store.store_value("daily_import_baseline").await.unwrap(), None);
    }
}
