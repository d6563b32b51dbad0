use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::error::Error;
use std::fs::{self, File};
use std::io::prelude::*;
use std::sync::RwLock;
use uuid::Uuid;

/// Fallback when the configured polling interval is outside the recognized
/// 5-300 second range.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 28;
pub const MIN_POLL_INTERVAL_SECS: u32 = 5;
pub const MAX_POLL_INTERVAL_SECS: u32 = 300;

fn mqtt_client_name_default() -> String { return "sdm2mqtt".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub ha_enabled: bool,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
}

fn meter_id_default() -> String { return String::new() }
fn meter_port_default() -> u16 { return 502 }
fn meter_unit_id_default() -> u8 { return 1 }
fn meter_polling_interval_default() -> u32 { return DEFAULT_POLL_INTERVAL_SECS as u32 }

#[derive(Deserialize, Serialize, Clone)]
pub struct MeterConfig {
    /// Stable instance id, generated at load when the file has none.
    #[serde(default="meter_id_default")]
    pub id: String,
    pub name: String,
    /// One of sdm630, sdm120, sdm72.
    pub model: String,
    pub host: String,
    #[serde(default="meter_port_default")]
    pub port: u16,
    #[serde(default="meter_unit_id_default")]
    pub unit_id: u8,
    #[serde(default="meter_polling_interval_default")]
    pub polling_interval: u32,
}

impl MeterConfig {
    pub fn effective_polling_interval(&self) -> u64 {
        if (MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&self.polling_interval) {
            return self.polling_interval as u64;
        }
        warn!(
            "Meter {}: polling interval {} outside {}-{}s, using default {}s",
            self.name,
            self.polling_interval,
            MIN_POLL_INTERVAL_SECS,
            MAX_POLL_INTERVAL_SECS,
            DEFAULT_POLL_INTERVAL_SECS
        );
        DEFAULT_POLL_INTERVAL_SECS
    }
}

fn meters_default() -> Vec<MeterConfig> { return Vec::new() }
fn state_dir_default() -> String { return "state".to_string() }

#[derive(Deserialize, Serialize, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
    /// Directory for the per-meter persisted state files.
    #[serde(default="state_dir_default")]
    pub state_dir: String,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        let mut config: Config = serde_yml::from_str(contents)?;
        for meter in config.meters.iter_mut() {
            if meter.id.is_empty() {
                meter.id = Uuid::new_v4().to_string();
            }
        }
        return Ok(config);
    }
}

#[derive(Deserialize, Serialize, Clone, PartialEq)]
pub enum ConfigOperation {
    ADD,
    DELETE,
    CHANGE
}

#[derive(Deserialize, Serialize, Clone)]
pub struct ConfigChange {
    pub operation: ConfigOperation,
    pub base: String, /* This is like mqtt, meters and so on */
}

#[derive(Clone)]
pub struct Callbacks {
    sender: tokio::sync::broadcast::Sender<ConfigChange>,
}

pub struct ConfigHolder {
    pub config: Config,
    pub callbacks: Callbacks,
    pub dirty: bool,
    pub lock: RwLock<bool>,
    pub base_path: String,
}

pub enum ConfigBases {
    Mqtt(MqttConfig),
    Meters(Vec<MeterConfig>),
}

impl ConfigHolder {
    pub fn load() -> Self {
        let mut bpath = "config/".to_string();
        /* Check for the two paths of the config file */
        let mut file = File::open("config/sdm2mqtt.yaml");
        if file.is_err() {
            file = Ok(File::open("sdm2mqtt.yaml").expect("Unable to read the config on config/sdm2mqtt.yaml or sdm2mqtt.yaml"));
            bpath = "".to_string();
        }

        let mut file = file.unwrap();

        let mut contents = String::new();
        file.read_to_string(&mut contents).expect("Unable to read config file");
        let c = Config::from_yaml(&contents).expect("Unable to parse config file");
        let (s, _) = tokio::sync::broadcast::channel(100);
        return ConfigHolder {
            config: c,
            callbacks: Callbacks { sender: s },
            dirty: false,
            lock: RwLock::new(true),
            base_path: bpath,
        }
    }

    pub fn save(&mut self) {
        /* No need to write config if it's not dirty */
        if !self.dirty {
            debug!("Who ever called me, the config is not dirty");
            return;
        }

        let config_path = format!("{}sdm2mqtt.yaml", self.base_path);
        let backup_path = format!("{}backup.yaml", self.base_path);

        if fs::copy(config_path.clone(), backup_path).is_err() {
            error!("Backing up config failed, not replacing it");
        } else {
            let x = serde_yml::to_string(&self.config).unwrap();
            match fs::write(config_path, x.as_bytes()) {
                Ok(_) => { info!("New Config written"); self.dirty = false; }
                Err(e) => { error!("Error writing config {e:?}"); }
            }
        }
    }

    pub fn get_change_receiver(&self) -> tokio::sync::broadcast::Receiver<ConfigChange> {
        return self.callbacks.sender.subscribe();
    }

    pub fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    pub fn update_config(&mut self, operation: ConfigOperation, new_data: ConfigBases) {
        let base: &str;

        match new_data {
            ConfigBases::Mqtt(mqtt_config) => {
                self.config.mqtt = mqtt_config;
                base = "mqtt";
            },
            ConfigBases::Meters(meter_configs) => {
                self.config.meters = meter_configs;
                base = "meters";
            },
        }

        self.dirty = true;

        let _ = self.callbacks.sender.send(ConfigChange { operation: operation, base: base.to_string()});
    }

    pub fn get_copy(&self, base: &str) -> Result<ConfigBases, Box<dyn Error>> {
        /* Lock against modifications during copy */
        let _lock = self.lock.read().unwrap();

        match base {
            "mqtt" => { return Ok(ConfigBases::Mqtt(self.config.mqtt.clone())) },
            "meters" => { return Ok(ConfigBases::Meters(self.config.meters.clone())) },
            _ => { Err("Type not known")? }
        }
    }

    pub fn get_complete_config(&self) -> Config {
        return self.config.clone();
    }
}

lazy_static! {
    pub static ref CONFIG: RwLock<ConfigHolder> = RwLock::new(ConfigHolder::load());
}

#[macro_export]
macro_rules! get_config_or_panic {
    ($base: expr, $pat: path) => {
        {
            let c = $crate::config::CONFIG.read().unwrap().get_copy($base).unwrap();
            if let $pat(a) = c { // #1
                a
            } else {
                panic!(
                    "mismatch variant when cast to {}",
                    stringify!($pat)); // #2
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
mqtt:
  host: broker.local
  port: 1883
  user: sdm
  pass: secret
  ha_enabled: true
meters:
  - name: garage
    model: sdm630
    host: 192.168.1.50
  - name: shed
    model: sdm120
    host: 192.168.1.51
    port: 10502
    unit_id: 3
    polling_interval: 60
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.mqtt.client_name, "sdm2mqtt");
        assert_eq!(config.state_dir, "state");
        assert_eq!(config.meters.len(), 2);

        let garage = &config.meters[0];
        assert_eq!(garage.port, 502);
        assert_eq!(garage.unit_id, 1);
        assert_eq!(garage.polling_interval, 28);
        assert!(!garage.id.is_empty());

        let shed = &config.meters[1];
        assert_eq!(shed.port, 10502);
        assert_eq!(shed.unit_id, 3);
        assert_eq!(shed.polling_interval, 60);
    }

    #[test]
    fn test_polling_interval_range() {
        let mut config = Config::from_yaml(EXAMPLE).unwrap();
        let meter = &mut config.meters[0];

        meter.polling_interval = 5;
        assert_eq!(meter.effective_polling_interval(), 5);
        meter.polling_interval = 300;
        assert_eq!(meter.effective_polling_interval(), 300);

        meter.polling_interval = 4;
        assert_eq!(meter.effective_polling_interval(), DEFAULT_POLL_INTERVAL_SECS);
        meter.polling_interval = 301;
        assert_eq!(meter.effective_polling_interval(), DEFAULT_POLL_INTERVAL_SECS);
        meter.polling_interval = 0;
        assert_eq!(meter.effective_polling_interval(), DEFAULT_POLL_INTERVAL_SECS);
    }
}
