use log::warn;

use crate::capability::ValueKind;

use super::mapping::{CapabilityMapping, Transform, Validator};
use super::registers::{reg, Encoding, RegisterDefinition};

/// Everything model-specific about a meter. A model is pure configuration:
/// the poller, decoder, mapping engine and daily trackers are shared.
pub struct MeterModel {
    pub id: &'static str,
    pub manufacturer: &'static str,
    pub model: &'static str,
    /// Measurement registers, read first on every tick.
    pub input_registers: &'static [(&'static str, RegisterDefinition)],
    /// Configuration registers, read second; keys override input keys.
    pub holding_registers: &'static [(&'static str, RegisterDefinition)],
    pub mappings: &'static [CapabilityMapping],
    /// Result keys of the lifetime energy counters feeding net energy and
    /// the daily trackers.
    pub import_energy_key: &'static str,
    pub export_energy_key: &'static str,
}

impl MeterModel {
    pub fn holding_register(&self, key: &str) -> Option<&RegisterDefinition> {
        self.holding_registers.iter().find(|(k, _)| *k == key).map(|(_, def)| def)
    }

    fn has_register(&self, key: &str) -> bool {
        self.input_registers.iter().chain(self.holding_registers).any(|(k, _)| *k == key)
    }

    pub fn mapping_for_capability(&self, capability: &str) -> Option<&CapabilityMapping> {
        self.mappings.iter().find(|m| m.capabilities.contains(&capability))
    }

    /// Check the mapping table against the register tables. A mapping whose
    /// result key matches no register can never fire; that is a table bug
    /// worth a warning at startup, not a silent no-op forever.
    pub fn validate(&self) -> usize {
        let mut unmatched = 0;
        for mapping in self.mappings {
            if !self.has_register(mapping.result_key) {
                warn!(
                    "Model {}: mapping for {:?} references unknown register {:?}",
                    self.id, mapping.capabilities, mapping.result_key
                );
                unmatched += 1;
            }
        }
        unmatched
    }
}

const fn map(
    result_key: &'static str,
    capabilities: &'static [&'static str],
    validator: Validator,
    transform: Transform,
) -> CapabilityMapping {
    CapabilityMapping {
        result_key,
        capabilities,
        validator,
        transform,
        kind: ValueKind::Number,
        require_existing: false,
    }
}

/* Eastron SDM630, three phase. Register addresses from the SDM630 Modbus
 * protocol document; everything is an IEEE-754 float over two words. */

static SDM630_INPUT_REGISTERS: &[(&str, RegisterDefinition)] = &[
    ("l1_voltage", reg(0, 2, Encoding::Float32, "Phase 1 Voltage", 0)),
    ("l2_voltage", reg(2, 2, Encoding::Float32, "Phase 2 Voltage", 0)),
    ("l3_voltage", reg(4, 2, Encoding::Float32, "Phase 3 Voltage", 0)),
    ("l1_current", reg(6, 2, Encoding::Float32, "Phase 1 Current", 0)),
    ("l2_current", reg(8, 2, Encoding::Float32, "Phase 2 Current", 0)),
    ("l3_current", reg(10, 2, Encoding::Float32, "Phase 3 Current", 0)),
    ("l1_power", reg(12, 2, Encoding::Float32, "Phase 1 Power", 0)),
    ("l2_power", reg(14, 2, Encoding::Float32, "Phase 2 Power", 0)),
    ("l3_power", reg(16, 2, Encoding::Float32, "Phase 3 Power", 0)),
    ("sum_line_current", reg(48, 2, Encoding::Float32, "Sum of Line Currents", 0)),
    ("total_system_power", reg(52, 2, Encoding::Float32, "Total System Power", 0)),
    ("total_apparent_power", reg(56, 2, Encoding::Float32, "Total System Apparent Power", 0)),
    ("total_reactive_power", reg(60, 2, Encoding::Float32, "Total System Reactive Power", 0)),
    ("total_power_factor", reg(62, 2, Encoding::Float32, "Total Power Factor", 0)),
    ("total_phase_angle", reg(66, 2, Encoding::Float32, "Total Phase Angle", 0)),
    ("frequency", reg(70, 2, Encoding::Float32, "Frequency of Supply Voltages", 0)),
    ("total_import_energy", reg(72, 2, Encoding::Float32, "Total Import Energy", 0)),
    ("total_export_energy", reg(74, 2, Encoding::Float32, "Total Export Energy", 0)),
];

static SDM630_MAPPINGS: &[CapabilityMapping] = &[
    map("total_system_power", &["current_power"], Validator::standard(), Transform::rounded()),
    map("l1_power", &["active_power_l1"], Validator::standard(), Transform::rounded()),
    map("l2_power", &["active_power_l2"], Validator::standard(), Transform::rounded()),
    map("l3_power", &["active_power_l3"], Validator::standard(), Transform::rounded()),
    map("l1_current", &["current_l1"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l2_current", &["current_l2"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l3_current", &["current_l3"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("sum_line_current", &["sum_current"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l1_voltage", &["voltage_l1"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l2_voltage", &["voltage_l2"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l3_voltage", &["voltage_l3"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("total_power_factor", &["power_factor"], Validator::standard(), Transform::scaled()),
    map("total_phase_angle", &["phase_angle"], Validator::standard(), Transform::scaled()),
    map("total_import_energy", &["total_energy_consumed"], Validator::standard(), Transform::scaled()),
    map("total_export_energy", &["total_energy_delivered"], Validator::standard(), Transform::scaled()),
    map("frequency", &["frequency"], Validator::standard(), Transform::scaled()),
];

static SDM630: MeterModel = MeterModel {
    id: "sdm630",
    manufacturer: "Eastron",
    model: "SDM630",
    input_registers: SDM630_INPUT_REGISTERS,
    holding_registers: &[],
    mappings: SDM630_MAPPINGS,
    import_energy_key: "total_import_energy",
    export_energy_key: "total_export_energy",
};

/* Eastron SDM120CT, single phase with CT clamp. Bi-directional, so it gets
 * the full import/export/daily treatment despite the single phase. */

static SDM120_INPUT_REGISTERS: &[(&str, RegisterDefinition)] = &[
    ("voltage", reg(0, 2, Encoding::Float32, "Voltage", 0)),
    ("current", reg(6, 2, Encoding::Float32, "Current", 0)),
    ("active_power", reg(12, 2, Encoding::Float32, "Active Power", 0)),
    ("apparent_power", reg(18, 2, Encoding::Float32, "Apparent Power", 0)),
    ("reactive_power", reg(24, 2, Encoding::Float32, "Reactive Power", 0)),
    ("power_factor", reg(30, 2, Encoding::Float32, "Power Factor", 0)),
    ("phase_angle", reg(36, 2, Encoding::Float32, "Phase Angle", 0)),
    ("frequency", reg(70, 2, Encoding::Float32, "Frequency", 0)),
    ("import_active_energy", reg(72, 2, Encoding::Float32, "Import Active Energy", 0)),
    ("export_active_energy", reg(74, 2, Encoding::Float32, "Export Active Energy", 0)),
    ("import_reactive_energy", reg(76, 2, Encoding::Float32, "Import Reactive Energy", 0)),
    ("export_reactive_energy", reg(78, 2, Encoding::Float32, "Export Reactive Energy", 0)),
    ("total_active_energy", reg(342, 2, Encoding::Float32, "Total Active Energy", 0)),
    ("total_reactive_energy", reg(344, 2, Encoding::Float32, "Total Reactive Energy", 0)),
];

static SDM120_MAPPINGS: &[CapabilityMapping] = &[
    map("voltage", &["voltage"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("current", &["current"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("active_power", &["current_power"], Validator::standard(), Transform::rounded()),
    map("apparent_power", &["apparent_power"], Validator::standard(), Transform::rounded()),
    map("reactive_power", &["reactive_power"], Validator::standard(), Transform::rounded()),
    map("power_factor", &["power_factor"], Validator::standard(), Transform::scaled()),
    map("phase_angle", &["phase_angle"], Validator::standard(), Transform::scaled()),
    map("frequency", &["frequency"], Validator::standard(), Transform::scaled()),
    map("import_active_energy", &["total_energy_consumed"], Validator::standard(), Transform::scaled()),
    map("export_active_energy", &["total_energy_delivered"], Validator::standard(), Transform::scaled()),
    // aliased onto the net-energy capability; the derived import-minus-export
    // value overwrites it later in the same tick
    map("total_active_energy", &["net_energy"], Validator::standard(), Transform::scaled()),
];

static SDM120: MeterModel = MeterModel {
    id: "sdm120",
    manufacturer: "Eastron",
    model: "SDM120CT",
    input_registers: SDM120_INPUT_REGISTERS,
    holding_registers: &[],
    mappings: SDM120_MAPPINGS,
    import_energy_key: "import_active_energy",
    export_energy_key: "export_active_energy",
};

/* Eastron SDM72D-M-2, three phase. Shares the SDM630 measurement layout but
 * exposes the demand interval as a writable holding register. */

static SDM72_INPUT_REGISTERS: &[(&str, RegisterDefinition)] = &[
    ("l1_voltage", reg(0, 2, Encoding::Float32, "Phase 1 Voltage", 0)),
    ("l2_voltage", reg(2, 2, Encoding::Float32, "Phase 2 Voltage", 0)),
    ("l3_voltage", reg(4, 2, Encoding::Float32, "Phase 3 Voltage", 0)),
    ("l1_current", reg(6, 2, Encoding::Float32, "Phase 1 Current", 0)),
    ("l2_current", reg(8, 2, Encoding::Float32, "Phase 2 Current", 0)),
    ("l3_current", reg(10, 2, Encoding::Float32, "Phase 3 Current", 0)),
    ("l1_power", reg(12, 2, Encoding::Float32, "Phase 1 Power", 0)),
    ("l2_power", reg(14, 2, Encoding::Float32, "Phase 2 Power", 0)),
    ("l3_power", reg(16, 2, Encoding::Float32, "Phase 3 Power", 0)),
    ("total_system_power", reg(52, 2, Encoding::Float32, "Total System Power", 0)),
    ("frequency", reg(70, 2, Encoding::Float32, "Frequency of Supply Voltages", 0)),
    ("total_import_energy", reg(72, 2, Encoding::Float32, "Total Import Energy", 0)),
    ("total_export_energy", reg(74, 2, Encoding::Float32, "Total Export Energy", 0)),
];

static SDM72_HOLDING_REGISTERS: &[(&str, RegisterDefinition)] =
    &[("demand_interval", reg(0, 1, Encoding::Uint16, "Demand Interval Minutes", 0))];

static SDM72_MAPPINGS: &[CapabilityMapping] = &[
    map("total_system_power", &["current_power"], Validator::standard(), Transform::rounded()),
    map("l1_power", &["active_power_l1"], Validator::standard(), Transform::rounded()),
    map("l2_power", &["active_power_l2"], Validator::standard(), Transform::rounded()),
    map("l3_power", &["active_power_l3"], Validator::standard(), Transform::rounded()),
    map("l1_current", &["current_l1"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l2_current", &["current_l2"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l3_current", &["current_l3"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l1_voltage", &["voltage_l1"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l2_voltage", &["voltage_l2"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("l3_voltage", &["voltage_l3"], Validator::rejecting_not_connected(), Transform::scaled()),
    map("total_import_energy", &["total_energy_consumed"], Validator::standard(), Transform::scaled()),
    map("total_export_energy", &["total_energy_delivered"], Validator::standard(), Transform::scaled()),
    map("frequency", &["frequency"], Validator::standard(), Transform::scaled()),
    map("demand_interval", &["demand_interval"], Validator::standard(), Transform::scaled()),
];

static SDM72: MeterModel = MeterModel {
    id: "sdm72",
    manufacturer: "Eastron",
    model: "SDM72D-M-2",
    input_registers: SDM72_INPUT_REGISTERS,
    holding_registers: SDM72_HOLDING_REGISTERS,
    mappings: SDM72_MAPPINGS,
    import_energy_key: "total_import_energy",
    export_energy_key: "total_export_energy",
};

pub fn get_model(id: &str) -> Option<&'static MeterModel> {
    match id.to_lowercase().as_str() {
        "sdm630" => Some(&SDM630),
        "sdm120" | "sdm120ct" => Some(&SDM120),
        "sdm72" | "sdm72d" => Some(&SDM72),
        _ => None,
    }
}
