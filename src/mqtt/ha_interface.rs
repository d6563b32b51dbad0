use serde::Serialize;

use crate::VERSION;

use super::TOPIC_BASE;

#[derive(Serialize)]
pub struct HaDevice {
    ids: String,
    name: String,
    manufacturer: String,
    model: String,
}

#[derive(Serialize)]
pub struct HaOrigin {
    pub name: String,
    pub sw_version: String,
    pub support_url: String,
}

fn is_none_str(value: &String) -> bool {
    if value.is_empty() || value == "NONE" {
        return true;
    }
    return false;
}

#[derive(Serialize)]
pub struct HaComponent {
    pub p: String,
    pub name: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub device_class: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub unit_of_measurement: String,
    pub value_template: String,
    pub unique_id: String,
    pub object_id: String,
    pub via_device: String,
    #[serde(skip_serializing_if = "is_none_str")]
    pub state_class: String,
}

/// Device class, unit and state class inferred from the capability name.
/// Daily and net energy counters reset or go backwards, so they are
/// `total` instead of `total_increasing`.
fn classify(capability: &str) -> (&'static str, &'static str, &'static str) {
    if capability.ends_with("_daily") || capability == "net_energy" {
        return ("energy", "kWh", "total");
    }
    if capability.contains("energy") {
        return ("energy", "kWh", "total_increasing");
    }
    if capability.contains("power_factor") {
        return ("power_factor", "NONE", "measurement");
    }
    if capability.contains("power") {
        return ("power", "W", "measurement");
    }
    if capability.contains("voltage") {
        return ("voltage", "V", "measurement");
    }
    if capability.contains("current") {
        return ("current", "A", "measurement");
    }
    if capability.contains("frequency") {
        return ("frequency", "Hz", "measurement");
    }
    if capability.contains("angle") {
        return ("NONE", "°", "measurement");
    }
    ("NONE", "NONE", "measurement")
}

impl HaComponent {
    pub fn for_capability(device: &str, proto: &str, capability: &str) -> Self {
        let (device_class, unit, state_class) = classify(capability);
        let safe_name = capability.replace(' ', "_");

        return HaComponent {
            p: "sensor".to_string(),
            name: capability.to_string(),
            device_class: device_class.to_string(),
            unit_of_measurement: unit.to_string(),
            value_template: format!("{{{{ value_json.{capability} }}}}"),
            unique_id: format!("s2m_{proto}_{device}_{safe_name}").to_lowercase(),
            object_id: format!("{device}_{safe_name}").to_lowercase(),
            state_class: state_class.to_string(),
            via_device: "s2m_management".to_string(),
        };
    }
}

#[derive(Serialize)]
pub struct HaDiscover {
    pub dev: HaDevice,
    pub o: HaOrigin,
    pub cmps: serde_json::Map<String, serde_json::Value>,
    pub state_topic: String,
    pub qos: u32,
    #[serde(skip_serializing)]
    pub discover_topic: String,
}

impl HaDiscover {
    pub fn new(name: String, manu: String, model: String, proto: String) -> Self {
        return HaDiscover {
            discover_topic: format!("homeassistant/device/s2m_{}-{}/config", proto.clone(), name.clone()),
            dev: HaDevice {
                ids: format!("s2m_{}_{}", proto.clone(), name.clone()),
                name: name.clone(),
                manufacturer: manu,
                model: model,
            },
            o: HaOrigin {
                name: "sdm2mqtt".to_string(),
                sw_version: VERSION.to_string(),
                support_url: "https://github.com/hessdev/sdm2mqtt".to_string(),
            },
            cmps: serde_json::Map::new(),
            state_topic: format!("{TOPIC_BASE}/devs/{}/{}", proto, name),
            qos: 2,
        }
    }

    pub fn get_dev_id(&self) -> String {
        return self.dev.ids.clone();
    }
}
