pub mod daily;
pub mod mapping;
pub mod meter;
pub mod models;
pub mod registers;

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

use crate::capability::StoreError;
use crate::config::{ConfigBases, ConfigChange, ConfigOperation, MeterConfig, CONFIG};
use crate::get_config_or_panic;
use crate::modbus::TransportError;
use crate::mqtt::store::MqttStore;
use crate::mqtt::{publish_protocol_count, SubscribeData, Transmission};

use meter::Meter;
use models::get_model;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Owns one polling task (and one command task) per configured meter.
/// Configuration changes abort and respawn everything, so a changed polling
/// interval restarts the timer and changed connection parameters apply on
/// the next tick.
pub struct MeterManager {
    sender: Sender<Transmission>,
    config_change: tokio::sync::broadcast::Receiver<ConfigChange>,
    threads: Vec<JoinHandle<()>>,
    config: Vec<MeterConfig>,
}

impl MeterManager {
    pub fn new(sender: Sender<Transmission>) -> Self {
        let config: Vec<MeterConfig> = get_config_or_panic!("meters", ConfigBases::Meters);

        MeterManager {
            sender,
            config_change: CONFIG.read().unwrap().get_change_receiver(),
            threads: Vec::new(),
            config,
        }
    }

    pub async fn start_thread(&mut self) {
        /* There may be no config to start with, so sleep until there is */
        if self.config.is_empty() {
            info!("No meters configured, waiting for a config change to wake me up");
            loop {
                let change = self.config_change.recv().await.unwrap();
                if change.operation != ConfigOperation::ADD || change.base != "meters" {
                    continue;
                }
                break;
            }
        }

        loop {
            self.config = get_config_or_panic!("meters", ConfigBases::Meters);
            let (state_dir, ha_enabled) = {
                let holder = CONFIG.read().unwrap();
                (holder.config.state_dir.clone(), holder.config.mqtt.ha_enabled)
            };
            let mut meter_count: u32 = 0;

            for conf in self.config.iter() {
                let model = match get_model(&conf.model) {
                    Some(model) => model,
                    None => {
                        error!("Meter {} has unknown model {:?}, skipping it", conf.name, conf.model);
                        continue;
                    }
                };

                /* Surfaces mapping entries that can never fire */
                model.validate();
                meter_count += 1;

                let store = Arc::new(MqttStore::open(
                    &conf.name,
                    model,
                    self.sender.clone(),
                    &state_dir,
                    ha_enabled,
                ));
                let meter = Arc::new(Meter::new(conf.clone(), model, store));

                /* Command topic feeds the write path */
                let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel(10);
                let subscribe = Transmission::Subscribe(SubscribeData {
                    topic: format!("devs/modbus/{}/set", conf.name),
                    sender: cmd_tx,
                });
                let _ = self.sender.send(subscribe).await;

                let command_meter = meter.clone();
                self.threads.push(tokio::spawn(async move {
                    while let Some(payload) = cmd_rx.recv().await {
                        handle_control_command(&command_meter, &payload).await;
                    }
                }));

                let interval = Duration::from_secs(conf.effective_polling_interval());
                info!(
                    "Meter {} ({}) at {}:{} unit {} polling every {:?}",
                    conf.name, model.model, conf.host, conf.port, conf.unit_id, interval
                );

                let poll_meter = meter.clone();
                self.threads.push(tokio::spawn(async move {
                    poll_meter.reinitialize_daily().await;
                    loop {
                        tokio::time::sleep(interval).await;
                        poll_meter.poll().await;
                    }
                }));
            }

            publish_protocol_count(&self.sender, "modbus", meter_count).await;
            info!("Modbus activated with {meter_count} meters, waiting for config changes");

            loop {
                let change = self.config_change.recv().await.unwrap();
                if change.base == "meters" {
                    break;
                }
            }

            /* Some of our config changed, stop every meter task and start over */
            info!("Meter configuration changed, restarting all meters");
            for thread in self.threads.iter() {
                thread.abort();
            }
            self.threads.clear();
        }
    }
}

#[derive(Deserialize)]
struct ControlCommand {
    capability: String,
    value: Value,
}

async fn handle_control_command(meter: &Meter, payload: &str) {
    match serde_json::from_str::<ControlCommand>(payload) {
        Ok(command) => {
            info!("[{}] control command for {}: {:?}", meter.name(), command.capability, command.value);
            meter.update_control(&command.capability, &command.value).await;
        }
        Err(e) => {
            warn!("[{}] unparseable control command {payload:?}: {e}", meter.name());
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;

    use crate::modbus::{ModbusTransport, TransportError};

    /// Scripted transport for orchestrator and decoder tests. Registers not
    /// seeded behave like failed reads.
    pub(crate) struct FakeTransport {
        input: HashMap<u16, Vec<u16>>,
        holding: HashMap<u16, Vec<u16>>,
        failing_input: HashSet<u16>,
        all_holding_fails: bool,
        pub(crate) writes: Vec<(u16, u16)>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            FakeTransport {
                input: HashMap::new(),
                holding: HashMap::new(),
                failing_input: HashSet::new(),
                all_holding_fails: false,
                writes: Vec::new(),
            }
        }

        pub fn set_input(&mut self, address: u16, words: Vec<u16>) {
            self.input.insert(address, words);
        }

        pub fn set_holding(&mut self, address: u16, words: Vec<u16>) {
            self.holding.insert(address, words);
        }

        pub fn set_input_f32(&mut self, address: u16, value: f32) {
            let bits = value.to_bits();
            self.set_input(address, vec![(bits >> 16) as u16, (bits & 0xFFFF) as u16]);
        }

        pub fn fail_input(&mut self, address: u16) {
            self.failing_input.insert(address);
        }

        pub fn fail_all_holding(&mut self) {
            self.all_holding_fails = true;
        }
    }

    #[async_trait]
    impl ModbusTransport for FakeTransport {
        async fn read_input_registers(
            &mut self,
            address: u16,
            _count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            if self.failing_input.contains(&address) {
                return Err(TransportError::Read(address, "scripted failure".to_string()));
            }
            self.input
                .get(&address)
                .cloned()
                .ok_or_else(|| TransportError::Read(address, "no response".to_string()))
        }

        async fn read_holding_registers(
            &mut self,
            address: u16,
            _count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            if self.all_holding_fails {
                return Err(TransportError::Read(address, "connection reset".to_string()));
            }
            self.holding
                .get(&address)
                .cloned()
                .ok_or_else(|| TransportError::Read(address, "no response".to_string()))
        }

        async fn write_single_register(
            &mut self,
            address: u16,
            value: u16,
        ) -> Result<(), TransportError> {
            self.writes.push((address, value));
            Ok(())
        }

        async fn close(&mut self) {}
    }
}
