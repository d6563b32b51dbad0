use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use log::{debug, error};
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tokio::sync::RwLock;

use crate::capability::state_file::StateFile;
use crate::capability::{CapabilityStore, StoreError, ValueKind};
use crate::metering::models::MeterModel;

use super::ha_interface::{HaComponent, HaDiscover};
use super::{build_reading, Transmission};

/// Production capability store: capability values live in memory and are
/// mirrored to the meter's MQTT state topic on every update, registration
/// re-publishes the retained Home Assistant discovery document, and
/// persisted values go to the per-meter state file.
pub struct MqttStore {
    meter_name: String,
    manufacturer: &'static str,
    model: &'static str,
    ha_enabled: bool,
    sender: Sender<Transmission>,
    capabilities: RwLock<HashMap<String, ValueKind>>,
    values: RwLock<HashMap<String, Value>>,
    persisted: RwLock<HashMap<String, Value>>,
    state_file: StateFile,
}

impl MqttStore {
    pub fn open<P: AsRef<Path>>(
        meter_name: &str,
        model: &MeterModel,
        sender: Sender<Transmission>,
        state_dir: P,
        ha_enabled: bool,
    ) -> Self {
        let state_file = StateFile::new(state_dir, meter_name);
        let persisted = state_file.load();

        MqttStore {
            meter_name: meter_name.to_string(),
            manufacturer: model.manufacturer,
            model: model.model,
            ha_enabled,
            sender,
            capabilities: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            persisted: RwLock::new(persisted),
            state_file,
        }
    }

    /// Retained discovery document covering every capability seen so far.
    async fn discovery_document(&self) -> HaDiscover {
        let mut discover = HaDiscover::new(
            self.meter_name.clone(),
            self.manufacturer.to_string(),
            self.model.to_string(),
            "modbus".to_string(),
        );

        for capability in self.capabilities.read().await.keys() {
            let component = HaComponent::for_capability(&self.meter_name, "modbus", capability);
            match serde_json::to_value(component) {
                Ok(doc) => {
                    discover.cmps.insert(capability.clone(), doc);
                }
                Err(e) => error!("Discovery for {capability} failed to serialize: {e}"),
            }
        }

        discover
    }
}

#[async_trait]
impl CapabilityStore for MqttStore {
    async fn has_capability(&self, name: &str) -> bool {
        self.capabilities.read().await.contains_key(name)
    }

    async fn add_capability(&self, name: &str, kind: ValueKind) -> Result<(), StoreError> {
        {
            let mut capabilities = self.capabilities.write().await;
            if capabilities.contains_key(name) {
                return Ok(());
            }
            capabilities.insert(name.to_string(), kind);
        }

        debug!("[{}] capability {name} registered", self.meter_name);
        if self.ha_enabled {
            let discover = self.discovery_document().await;
            if self.sender.send(Transmission::AutoDiscovery(discover)).await.is_err() {
                error!("[{}] discovery for {name} not sent, MQTT channel gone", self.meter_name);
            }
        }
        Ok(())
    }

    async fn capability_value(&self, name: &str) -> Option<Value> {
        self.values.read().await.get(name).cloned()
    }

    async fn set_capability_value(&self, name: &str, value: Value) -> Result<(), StoreError> {
        let snapshot = {
            let mut values = self.values.write().await;
            values.insert(name.to_string(), value);
            values.clone()
        };

        /* Fire and forget: a full value document per update, losing one is fine */
        let reading = build_reading(&self.meter_name, self.model, &snapshot);
        if self.sender.send(Transmission::Metering(reading)).await.is_err() {
            error!("[{}] update for {name} not published, MQTT channel gone", self.meter_name);
        }
        Ok(())
    }

    async fn store_value(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let value = self.persisted.read().await.get(key).cloned();
        Ok(value.filter(|v| !v.is_null()))
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
        self.state_file.save(&persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::models::get_model;
    use serde_json::json;

    fn store_with_channel(
        dir: &Path,
    ) -> (MqttStore, tokio::sync::mpsc::Receiver<Transmission>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let store = MqttStore::open("garage", get_model("sdm630").unwrap(), tx, dir, true);
        (store, rx)
    }

    #[tokio::test]
    async fn test_add_capability_publishes_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx) = store_with_channel(dir.path());

        store.add_capability("voltage_l1", ValueKind::Number).await.unwrap();
        assert!(store.has_capability("voltage_l1").await);

        match rx.recv().await.unwrap() {
            Transmission::AutoDiscovery(disc) => {
                assert_eq!(disc.get_dev_id(), "s2m_modbus_garage");
                assert!(disc.cmps.contains_key("voltage_l1"));
            }
            _ => panic!("expected a discovery document"),
        }

        // re-registering is a no-op and publishes nothing new
        store.add_capability("voltage_l1", ValueKind::Number).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_value_publishes_reading() {
        let dir = tempfile::tempdir().unwrap();
        let (store, mut rx) = store_with_channel(dir.path());

        store.set_capability_value("current_power", json!(1521.0)).await.unwrap();
        assert_eq!(store.capability_value("current_power").await, Some(json!(1521.0)));

        match rx.recv().await.unwrap() {
            Transmission::Metering(reading) => {
                assert_eq!(reading.meter_name, "garage");
                assert_eq!(reading.values["current_power"], json!(1521.0));
            }
            _ => panic!("expected a meter reading"),
        }
    }

    #[tokio::test]
    async fn test_persisted_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (store, _rx) = store_with_channel(dir.path());
            store
                .set_store_value("daily_import_baseline", Some(json!(120.5)))
                .await
                .unwrap();
        }

        let (reopened, _rx) = store_with_channel(dir.path());
        assert_eq!(
            reopened.store_value("daily_import_baseline").await.unwrap(),
            Some(json!(120.5))
        );

        reopened.set_store_value("daily_import_baseline", None).await.unwrap();
        assert_eq!(reopened.store_value("daily_import_baseline").await.unwrap(), None);
    }
}
