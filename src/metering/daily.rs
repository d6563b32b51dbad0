use chrono::{DateTime, Local};
use log::{error, info, warn};
use serde_json::json;

use crate::capability::{CapabilityStore, StoreError, ValueKind};

use super::mapping::round2;
use super::registers::Measurement;

/// The meter's lifetime counters never reset; these trackers turn them into
/// since-local-midnight counters, one independent instance per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyDirection {
    Import,
    Export,
}

impl EnergyDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyDirection::Import => "import",
            EnergyDirection::Export => "export",
        }
    }

    /// Persisted key for the lifetime-counter value captured at the start
    /// of the current local day.
    pub fn baseline_key(&self) -> &'static str {
        match self {
            EnergyDirection::Import => "daily_import_baseline",
            EnergyDirection::Export => "daily_export_baseline",
        }
    }

    /// Persisted key for the moment the baseline was last re-captured.
    pub fn reset_date_key(&self) -> &'static str {
        match self {
            EnergyDirection::Import => "last_daily_reset_import",
            EnergyDirection::Export => "last_daily_reset_export",
        }
    }

    pub fn daily_capability(&self) -> &'static str {
        match self {
            EnergyDirection::Import => "energy_consumed_daily",
            EnergyDirection::Export => "energy_delivered_daily",
        }
    }
}

/// True when `now` is on a later local calendar day than the stored reset
/// moment. Dates are compared at local midnight, so this fires on the day
/// boundary and not after some elapsed duration. An unparseable stored date
/// counts as a new day so the tracker can recover.
pub(crate) fn is_new_day(last_reset: Option<&str>, now: DateTime<Local>) -> bool {
    let raw = match last_reset {
        Some(raw) => raw,
        None => return true,
    };

    let parsed = match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Stored reset date {raw:?} unparseable ({e}), forcing reset");
            return true;
        }
    };

    parsed.with_timezone(&Local).date_naive() < now.date_naive()
}

pub struct DailyEnergyTracker {
    direction: EnergyDirection,
}

impl DailyEnergyTracker {
    pub fn new(direction: EnergyDirection) -> Self {
        DailyEnergyTracker { direction }
    }

    /// Feed one validated lifetime-counter reading. Failures are logged and
    /// turn the tick into a no-op for this direction only.
    pub async fn update(&self, store: &dyn CapabilityStore, measurement: &Measurement) {
        if let Err(e) = self.try_update(store, measurement, Local::now()).await {
            error!("Daily {} calculation failed: {e}", self.direction.as_str());
        }
    }

    pub(crate) async fn try_update(
        &self,
        store: &dyn CapabilityStore,
        measurement: &Measurement,
        now: DateTime<Local>,
    ) -> Result<(), StoreError> {
        let total = match measurement.numeric() {
            Some(total) => total,
            None => return Ok(()),
        };

        let capability = self.direction.daily_capability();
        let last_reset = store.store_value(self.direction.reset_date_key()).await?;
        let baseline = store
            .store_value(self.direction.baseline_key())
            .await?
            .and_then(|v| v.as_f64());

        if !store.has_capability(capability).await {
            store.add_capability(capability, ValueKind::Number).await?;
        }

        let last_reset = last_reset.as_ref().and_then(|v| v.as_str().map(str::to_string));

        if is_new_day(last_reset.as_deref(), now) {
            info!(
                "Daily reset: new day, {} baseline set to {total}",
                self.direction.as_str()
            );
            // baseline first, reset date last: the reset date is the commit
            // marker, a failure in between redoes the reset next tick
            store
                .set_store_value(self.direction.baseline_key(), Some(json!(total)))
                .await?;
            store
                .set_store_value(self.direction.reset_date_key(), Some(json!(now.to_rfc3339())))
                .await?;
            store.set_capability_value(capability, json!(0.0)).await?;
        } else if let Some(baseline) = baseline {
            let daily = round2(total - baseline);
            let current = store.capability_value(capability).await.and_then(|v| v.as_f64());

            if current != Some(daily) {
                let clamped = if daily > 0.0 { daily } else { 0.0 };
                info!(
                    "Daily {}: {clamped} (total {total}, baseline {baseline})",
                    self.direction.as_str()
                );
                store.set_capability_value(capability, json!(clamped)).await?;
            }
        }

        Ok(())
    }

    /// Startup pass: when the stored reset date is from an earlier day (or
    /// absent) the daily counter restarts at 0 and the baseline is cleared
    /// so the next reading re-establishes it; otherwise the stored daily
    /// value survives the restart untouched.
    pub async fn reinitialize(&self, store: &dyn CapabilityStore) {
        if let Err(e) = self.try_reinitialize(store, Local::now()).await {
            error!("Daily {} startup init failed: {e}", self.direction.as_str());
        }
    }

    pub(crate) async fn try_reinitialize(
        &self,
        store: &dyn CapabilityStore,
        now: DateTime<Local>,
    ) -> Result<(), StoreError> {
        let capability = self.direction.daily_capability();
        if !store.has_capability(capability).await {
            store.add_capability(capability, ValueKind::Number).await?;
        }

        let last_reset = store.store_value(self.direction.reset_date_key()).await?;
        let last_reset = last_reset.as_ref().and_then(|v| v.as_str().map(str::to_string));

        if is_new_day(last_reset.as_deref(), now) {
            store.set_capability_value(capability, json!(0.0)).await?;
            store.set_store_value(self.direction.baseline_key(), None).await?;
            store.set_store_value(self.direction.reset_date_key(), None).await?;
            info!(
                "Startup on a new day: {} daily counter cleared",
                self.direction.as_str()
            );
        } else {
            let kept = store.capability_value(capability).await;
            info!(
                "Startup on the same day: keeping {} daily counter at {kept:?}",
                self.direction.as_str()
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::Value;

    fn reading(value: &str) -> Measurement {
        Measurement {
            value: value.to_string(),
            scale: "0".to_string(),
            label: "Total Import Energy".to_string(),
        }
    }

    fn at(y: i32, m: u32, d: u32, hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, hour, 30, 0).unwrap()
    }

    async fn daily_value(store: &MemoryStore) -> Option<f64> {
        store
            .capability_value(EnergyDirection::Import.daily_capability())
            .await
            .and_then(|v| v.as_f64())
    }

    #[tokio::test]
    async fn test_same_day_sequence() {
        let store = MemoryStore::new();
        let tracker = DailyEnergyTracker::new(EnergyDirection::Import);

        // first reading establishes the baseline and reports 0
        tracker.try_update(&store, &reading("100.0"), at(2026, 8, 8, 9)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(0.0));
        assert_eq!(
            store.store_value("daily_import_baseline").await.unwrap(),
            Some(json!(100.0))
        );

        // unchanged total keeps the counter at 0
        tracker.try_update(&store, &reading("100.0"), at(2026, 8, 8, 10)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(0.0));

        tracker.try_update(&store, &reading("105.5"), at(2026, 8, 8, 11)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(5.5));
    }

    #[tokio::test]
    async fn test_day_rollover_resets_baseline() {
        let store = MemoryStore::new();
        let tracker = DailyEnergyTracker::new(EnergyDirection::Import);

        tracker.try_update(&store, &reading("100.0"), at(2026, 8, 8, 9)).await.unwrap();
        tracker.try_update(&store, &reading("140.0"), at(2026, 8, 8, 23)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(40.0));

        // next morning: baseline jumps to the current total, counter restarts
        tracker.try_update(&store, &reading("141.5"), at(2026, 8, 9, 0)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(0.0));
        assert_eq!(
            store.store_value("daily_import_baseline").await.unwrap(),
            Some(json!(141.5))
        );
    }

    #[tokio::test]
    async fn test_negative_delta_clamped_to_zero() {
        let store = MemoryStore::new();
        let tracker = DailyEnergyTracker::new(EnergyDirection::Import);

        tracker.try_update(&store, &reading("100.0"), at(2026, 8, 8, 9)).await.unwrap();
        // counter going backwards must never surface as a negative daily value
        tracker.try_update(&store, &reading("99.0"), at(2026, 8, 8, 10)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(0.0));
    }

    #[tokio::test]
    async fn test_directions_are_independent() {
        let store = MemoryStore::new();
        let import = DailyEnergyTracker::new(EnergyDirection::Import);
        let export = DailyEnergyTracker::new(EnergyDirection::Export);

        import.try_update(&store, &reading("100.0"), at(2026, 8, 8, 9)).await.unwrap();
        export.try_update(&store, &reading("40.0"), at(2026, 8, 8, 9)).await.unwrap();
        import.try_update(&store, &reading("103.0"), at(2026, 8, 8, 12)).await.unwrap();
        export.try_update(&store, &reading("41.25"), at(2026, 8, 8, 12)).await.unwrap();

        assert_eq!(daily_value(&store).await, Some(3.0));
        let exported = store
            .capability_value(EnergyDirection::Export.daily_capability())
            .await
            .and_then(|v| v.as_f64());
        assert_eq!(exported, Some(1.25));
    }

    #[tokio::test]
    async fn test_is_new_day_compares_calendar_days() {
        let evening = at(2026, 8, 8, 23);
        assert!(is_new_day(None, evening));
        assert!(is_new_day(Some("garbage"), evening));

        let stored = at(2026, 8, 8, 0).to_rfc3339();
        // 23 hours later but the same calendar day
        assert!(!is_new_day(Some(&stored), evening));
        // a minute into the next day crosses the boundary
        assert!(is_new_day(Some(&stored), at(2026, 8, 9, 0)));
    }

    #[tokio::test]
    async fn test_startup_reinitialize() {
        let store = MemoryStore::new();
        let tracker = DailyEnergyTracker::new(EnergyDirection::Import);

        tracker.try_update(&store, &reading("100.0"), at(2026, 8, 8, 9)).await.unwrap();
        tracker.try_update(&store, &reading("104.0"), at(2026, 8, 8, 18)).await.unwrap();

        // restart on the same day keeps the counter and the baseline
        tracker.try_reinitialize(&store, at(2026, 8, 8, 19)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(4.0));
        assert!(store.store_value("daily_import_baseline").await.unwrap().is_some());

        // restart on the next day clears everything for the first reading
        tracker.try_reinitialize(&store, at(2026, 8, 9, 6)).await.unwrap();
        assert_eq!(daily_value(&store).await, Some(0.0));
        assert_eq!(store.store_value("daily_import_baseline").await.unwrap(), None);
        assert_eq!(store.store_value("last_daily_reset_import").await.unwrap(), None);
    }

    /// Store whose persisted side fails, to prove a tick degrades to a
    /// no-op instead of corrupting state.
    struct BrokenPersistence {
        inner: MemoryStore,
    }

    #[async_trait]
    impl CapabilityStore for BrokenPersistence {
        async fn has_capability(&self, name: &str) -> bool {
            self.inner.has_capability(name).await
        }
        async fn add_capability(&self, name: &str, kind: ValueKind) -> Result<(), StoreError> {
            self.inner.add_capability(name, kind).await
        }
        async fn capability_value(&self, name: &str) -> Option<Value> {
            self.inner.capability_value(name).await
        }
        async fn set_capability_value(&self, name: &str, value: Value) -> Result<(), StoreError> {
            self.inner.set_capability_value(name, value).await
        }
        async fn store_value(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Persistence("disk gone".to_string()))
        }
        async fn set_store_value(&self, _key: &str, _value: Option<Value>) -> Result<(), StoreError> {
            Err(StoreError::Persistence("disk gone".to_string()))
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_a_no_op() {
        let store = BrokenPersistence { inner: MemoryStore::new() };
        let tracker = DailyEnergyTracker::new(EnergyDirection::Import);

        let result = tracker.try_update(&store, &reading("100.0"), at(2026, 8, 8, 9)).await;
        assert!(result.is_err());
        // nothing was reported for this tick
        assert_eq!(store.inner.capability_value("energy_consumed_daily").await, None);

        // the public entry point swallows the failure
        tracker.update(&store, &reading("100.0")).await;
    }
}
