use std::collections::HashMap;

use log::{debug, error};
use serde_json::json;

use crate::capability::{CapabilityStore, ValueKind};

use super::registers::{Measurement, INVALID_NUMERIC_VALUE};

/// Capability holding import minus export, derived instead of measured.
pub const NET_ENERGY_CAPABILITY: &str = "net_energy";

/// Shared validation template. Every validator rejects the invalid marker;
/// current and voltage channels additionally reject `-1` (CT not connected).
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    reject_not_connected: bool,
}

impl Validator {
    pub const fn standard() -> Self {
        Validator { reject_not_connected: false }
    }

    pub const fn rejecting_not_connected() -> Self {
        Validator { reject_not_connected: true }
    }

    pub fn validate(&self, measurement: &Measurement) -> bool {
        if !measurement.is_valid() {
            return false;
        }
        if self.reject_not_connected && measurement.value == INVALID_NUMERIC_VALUE {
            return false;
        }
        true
    }
}

/// Shared transform template: `value * 10^scale`, optionally rounded to the
/// nearest integer for power channels where sub-watt precision is noise.
#[derive(Debug, Clone, Copy)]
pub struct Transform {
    round: bool,
}

impl Transform {
    pub const fn scaled() -> Self {
        Transform { round: false }
    }

    pub const fn rounded() -> Self {
        Transform { round: true }
    }

    pub fn apply(&self, measurement: &Measurement) -> Option<f64> {
        let value = measurement.numeric()?;
        Some(if self.round { value.round() } else { value })
    }
}

/// One row of a meter model's declarative mapping table: which decoded
/// register feeds which capabilities, and how.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityMapping {
    pub result_key: &'static str,
    pub capabilities: &'static [&'static str],
    pub validator: Validator,
    pub transform: Transform,
    pub kind: ValueKind,
    /// When set, the mapping only updates capabilities that already exist
    /// instead of registering them.
    pub require_existing: bool,
}

/// Run the mapping table over one poll's measurements, in declaration order.
/// Missing registers and failed validations are skipped silently (expected
/// for optional registers and invalid readings); a failure on one capability
/// never stops the others.
pub async fn apply_mappings(
    store: &dyn CapabilityStore,
    mappings: &[CapabilityMapping],
    result: &HashMap<String, Measurement>,
) {
    for mapping in mappings {
        let data = match result.get(mapping.result_key) {
            Some(data) => data,
            None => continue,
        };

        if !mapping.validator.validate(data) {
            continue;
        }

        if mapping.require_existing && !store.has_capability(mapping.capabilities[0]).await {
            continue;
        }

        let value = match mapping.transform.apply(data) {
            Some(value) => value,
            None => continue,
        };

        for capability in mapping.capabilities {
            if let Err(e) = store.add_capability(capability, mapping.kind).await {
                error!("Registering capability {capability} failed: {e}");
            }
            if let Err(e) = store.set_capability_value(capability, json!(value)).await {
                error!("Updating capability {capability} failed: {e}");
            }
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Publish net energy (import minus export, two decimals) when both energy
/// totals decoded. Independent of the mapping table.
pub async fn publish_net_energy(
    store: &dyn CapabilityStore,
    import: Option<&Measurement>,
    export: Option<&Measurement>,
) -> Option<f64> {
    let (import, export) = match (import, export) {
        (Some(im), Some(ex)) if im.is_valid() && ex.is_valid() => (im, ex),
        _ => return None,
    };

    let net = round2(import.numeric()? - export.numeric()?);
    debug!(
        "Net energy {net} (import {:?}, export {:?})",
        import.numeric(),
        export.numeric()
    );

    if let Err(e) = store.add_capability(NET_ENERGY_CAPABILITY, ValueKind::Number).await {
        error!("Registering capability {NET_ENERGY_CAPABILITY} failed: {e}");
    }
    if let Err(e) = store.set_capability_value(NET_ENERGY_CAPABILITY, json!(net)).await {
        error!("Updating capability {NET_ENERGY_CAPABILITY} failed: {e}");
    }

    Some(net)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MemoryStore;
    use crate::metering::registers::INVALID_VALUE;

    fn measurement(value: &str, scale: &str) -> Measurement {
        Measurement {
            value: value.to_string(),
            scale: scale.to_string(),
            label: "test".to_string(),
        }
    }

    #[test]
    fn test_validator_rejects_invalid_marker() {
        let validator = Validator::standard();
        assert!(!validator.validate(&measurement(INVALID_VALUE, "0")));
        assert!(validator.validate(&measurement("-1", "0")));
        assert!(validator.validate(&measurement("230.5", "0")));
    }

    #[test]
    fn test_validator_rejects_not_connected() {
        let validator = Validator::rejecting_not_connected();
        assert!(!validator.validate(&measurement(INVALID_VALUE, "0")));
        assert!(!validator.validate(&measurement("-1", "0")));
        assert!(validator.validate(&measurement("5.2", "0")));
    }

    #[test]
    fn test_transform_scales_and_rounds() {
        assert_eq!(Transform::scaled().apply(&measurement("1234", "-1")), Some(123.4));
        assert_eq!(Transform::rounded().apply(&measurement("1234", "-1")), Some(123.0));
        assert_eq!(Transform::scaled().apply(&measurement("not numeric", "0")), None);
    }

    const TEST_MAPPINGS: &[CapabilityMapping] = &[
        CapabilityMapping {
            result_key: "power",
            capabilities: &["current_power"],
            validator: Validator::standard(),
            transform: Transform::rounded(),
            kind: ValueKind::Number,
            require_existing: false,
        },
        CapabilityMapping {
            result_key: "current",
            capabilities: &["current_l1"],
            validator: Validator::rejecting_not_connected(),
            transform: Transform::scaled(),
            kind: ValueKind::Number,
            require_existing: false,
        },
        CapabilityMapping {
            result_key: "power",
            capabilities: &["current_power"],
            validator: Validator::standard(),
            transform: Transform::scaled(),
            kind: ValueKind::Number,
            require_existing: false,
        },
    ];

    #[tokio::test]
    async fn test_mappings_applied_in_declaration_order() {
        let store = MemoryStore::new();
        let mut result = HashMap::new();
        result.insert("power".to_string(), measurement("1520.6", "0"));

        apply_mappings(&store, TEST_MAPPINGS, &result).await;

        // the later unrounded mapping wins over the rounded one
        assert_eq!(store.capability_value("current_power").await, Some(json!(1520.6)));
    }

    #[tokio::test]
    async fn test_missing_and_invalid_registers_skipped() {
        let store = MemoryStore::new();
        let mut result = HashMap::new();
        result.insert("current".to_string(), measurement("-1", "0"));

        apply_mappings(&store, TEST_MAPPINGS, &result).await;

        assert!(!store.has_capability("current_power").await);
        assert!(!store.has_capability("current_l1").await);
    }

    #[tokio::test]
    async fn test_require_existing_blocks_unregistered_capability() {
        let gated: &[CapabilityMapping] = &[CapabilityMapping {
            result_key: "frequency",
            capabilities: &["frequency"],
            validator: Validator::standard(),
            transform: Transform::scaled(),
            kind: ValueKind::Number,
            require_existing: true,
        }];

        let store = MemoryStore::new();
        let mut result = HashMap::new();
        result.insert("frequency".to_string(), measurement("50.02", "0"));

        apply_mappings(&store, gated, &result).await;
        assert!(!store.has_capability("frequency").await);

        store.add_capability("frequency", ValueKind::Number).await.unwrap();
        apply_mappings(&store, gated, &result).await;
        assert_eq!(store.capability_value("frequency").await, Some(json!(50.02)));
    }

    #[tokio::test]
    async fn test_mapping_engine_is_idempotent() {
        let store = MemoryStore::new();
        let mut result = HashMap::new();
        result.insert("power".to_string(), measurement("980.25", "0"));
        result.insert("current".to_string(), measurement("4.2", "0"));

        apply_mappings(&store, TEST_MAPPINGS, &result).await;
        let first_power = store.capability_value("current_power").await;
        let first_current = store.capability_value("current_l1").await;

        apply_mappings(&store, TEST_MAPPINGS, &result).await;
        assert_eq!(store.capability_value("current_power").await, first_power);
        assert_eq!(store.capability_value("current_l1").await, first_current);
    }

    #[tokio::test]
    async fn test_net_energy() {
        let store = MemoryStore::new();
        let net = publish_net_energy(
            &store,
            Some(&measurement("120.00", "0")),
            Some(&measurement("45.30", "0")),
        )
        .await;

        assert_eq!(net, Some(74.7));
        assert_eq!(store.capability_value(NET_ENERGY_CAPABILITY).await, Some(json!(74.7)));
    }

    #[tokio::test]
    async fn test_net_energy_needs_both_totals() {
        let store = MemoryStore::new();
        let net = publish_net_energy(
            &store,
            Some(&measurement("120.00", "0")),
            Some(&measurement(INVALID_VALUE, "0")),
        )
        .await;

        assert_eq!(net, None);
        assert!(!store.has_capability(NET_ENERGY_CAPABILITY).await);
    }
}
