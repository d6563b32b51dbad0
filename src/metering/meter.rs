use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::capability::{CapabilityStore, ValueKind};
use crate::config::MeterConfig;
use crate::modbus::{self, ModbusTransport};

use super::daily::{DailyEnergyTracker, EnergyDirection};
use super::mapping::{apply_mappings, publish_net_energy};
use super::models::MeterModel;
use super::registers::{encode_register_value, read_register_block, Measurement, RegisterSpace};
use super::MeterError;

/// Bound on connecting and on each register exchange during a poll tick.
const POLL_TIMEOUT: Duration = Duration::from_secs(22);

/// Writes use a tighter bound, matching an interactive control action.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

/// One configured meter: the poll orchestrator plus its daily trackers.
/// Exactly one poll tick may be in flight at a time; a timer firing while
/// the previous tick still runs is dropped, never queued.
pub struct Meter {
    config: MeterConfig,
    model: &'static MeterModel,
    store: Arc<dyn CapabilityStore>,
    import_tracker: DailyEnergyTracker,
    export_tracker: DailyEnergyTracker,
    busy: AtomicBool,
}

impl Meter {
    pub fn new(config: MeterConfig, model: &'static MeterModel, store: Arc<dyn CapabilityStore>) -> Self {
        Meter {
            config,
            model,
            store,
            import_tracker: DailyEnergyTracker::new(EnergyDirection::Import),
            export_tracker: DailyEnergyTracker::new(EnergyDirection::Export),
            busy: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &'static MeterModel {
        self.model
    }

    /// Startup pass over both daily counters, see `DailyEnergyTracker`.
    pub async fn reinitialize_daily(&self) {
        self.import_tracker.reinitialize(self.store.as_ref()).await;
        self.export_tracker.reinitialize(self.store.as_ref()).await;
    }

    /// One poll tick: connect, read both register tables, process, tear
    /// down. Nothing escapes; a failed tick only means fewer updates.
    pub async fn poll(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("[{}] previous poll still running, dropping this tick", self.name());
            return;
        }

        let outcome = self.poll_once().await;
        self.busy.store(false, Ordering::SeqCst);

        if let Err(e) = outcome {
            error!("[{}] poll failed: {e}", self.name());
        }
    }

    async fn poll_once(&self) -> Result<(), MeterError> {
        debug!("[{}] poll started ({}:{} unit {})",
            self.name(), self.config.host, self.config.port, self.config.unit_id);

        let mut transport = modbus::connect(
            &self.config.host,
            self.config.port,
            self.config.unit_id,
            POLL_TIMEOUT,
        )
        .await?;

        let result = self.read_all(&mut transport).await;
        transport.close().await;

        self.process_result(&result).await;
        debug!("[{}] poll finished", self.name());
        Ok(())
    }

    /// Read the input table, then the holding table, merged into one map.
    /// Holding keys override input keys on collision; models are laid out
    /// not to overlap.
    pub(crate) async fn read_all(
        &self,
        transport: &mut dyn ModbusTransport,
    ) -> HashMap<String, Measurement> {
        let mut result =
            read_register_block(transport, RegisterSpace::Input, self.model.input_registers).await;
        result.extend(
            read_register_block(transport, RegisterSpace::Holding, self.model.holding_registers)
                .await,
        );
        result
    }

    pub(crate) async fn process_result(&self, result: &HashMap<String, Measurement>) {
        for (key, m) in result {
            debug!("[{}] {key} = {} (scale {}, {})", self.name(), m.value, m.scale, m.label);
        }

        let store = self.store.as_ref();
        apply_mappings(store, self.model.mappings, result).await;

        let import = result.get(self.model.import_energy_key);
        let export = result.get(self.model.export_energy_key);
        publish_net_energy(store, import, export).await;

        if let Some(import) = import.filter(|m| m.is_valid()) {
            self.import_tracker.update(store, import).await;
        }
        if let Some(export) = export.filter(|m| m.is_valid()) {
            self.export_tracker.update(store, export).await;
        }
    }

    /// Write path for actuator-style capabilities: reverse-look-up the
    /// holding register behind the capability, encode with inverted scale,
    /// write one register and reflect the accepted value. Every lookup or
    /// encoding problem is logged and skipped, never raised.
    pub async fn update_control(&self, capability: &str, value: &Value) {
        let (address, encoded, kind) = match self.prepare_control_write(capability, value) {
            Some(prepared) => prepared,
            None => return,
        };

        let mut transport = match modbus::connect(
            &self.config.host,
            self.config.port,
            self.config.unit_id,
            CONTROL_TIMEOUT,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!("[{}] control write connect failed: {e}", self.name());
                return;
            }
        };

        self.write_control(&mut transport, address, encoded, kind, capability, value).await;
        transport.close().await;
    }

    /// Resolve a capability to its holding register and encode the value,
    /// without touching the transport.
    pub(crate) fn prepare_control_write(
        &self,
        capability: &str,
        value: &Value,
    ) -> Option<(u16, u16, ValueKind)> {
        let mapping = match self.model.mapping_for_capability(capability) {
            Some(mapping) => mapping,
            None => {
                warn!("[{}] no mapping for capability {capability}", self.name());
                return None;
            }
        };

        let def = match self.model.holding_register(mapping.result_key) {
            Some(def) => def,
            None => {
                warn!(
                    "[{}] capability {capability} has no writable register ({})",
                    self.name(),
                    mapping.result_key
                );
                return None;
            }
        };

        let requested = match value.as_f64().or_else(|| value.as_str()?.parse().ok()) {
            Some(requested) => requested,
            None => {
                warn!("[{}] value {value:?} for {capability} is not numeric", self.name());
                return None;
            }
        };

        match encode_register_value(def, requested) {
            Some(encoded) => Some((def.address, encoded, mapping.kind)),
            None => {
                warn!(
                    "[{}] value {requested} for {capability} does not fit register {}",
                    self.name(),
                    def.address
                );
                None
            }
        }
    }

    pub(crate) async fn write_control(
        &self,
        transport: &mut dyn ModbusTransport,
        address: u16,
        encoded: u16,
        kind: ValueKind,
        capability: &str,
        value: &Value,
    ) {
        match transport.write_single_register(address, encoded).await {
            Ok(()) => {
                info!("[{}] wrote {encoded} to register {address} for {capability}", self.name());
                self.reflect_accepted_value(kind, capability, value).await;
            }
            Err(e) => error!("[{}] control write failed: {e}", self.name()),
        }
    }

    async fn reflect_accepted_value(&self, kind: ValueKind, capability: &str, value: &Value) {
        let typed = match kind.coerce(value) {
            Some(typed) => typed,
            None => {
                warn!("[{}] accepted value {value:?} not coercible for {capability}", self.name());
                return;
            }
        };

        if let Err(e) = self.store.add_capability(capability, kind).await {
            error!("[{}] registering {capability} failed: {e}", self.name());
        }
        if let Err(e) = self.store.set_capability_value(capability, typed).await {
            error!("[{}] reflecting {capability} failed: {e}", self.name());
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}
