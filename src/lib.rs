//! Poll Eastron SDM energy meters over Modbus TCP, map decoded registers
//! onto named capabilities and export them to MQTT with Home Assistant
//! discovery, including daily import/export counters derived from the
//! meters' lifetime totals.

pub mod capability;
pub mod config;
pub mod metering;
pub mod modbus;
pub mod mqtt;

// Re-export common types for easier access
pub use capability::{CapabilityStore, MemoryStore, ValueKind};
pub use config::CONFIG;
pub use metering::meter::Meter;
pub use metering::models::{get_model, MeterModel};
pub use metering::MeterManager;
pub use mqtt::MqttManager;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now().duration_since(std::time::SystemTime::UNIX_EPOCH).unwrap().as_secs();
}
