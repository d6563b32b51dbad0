use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error};
use serde_json::Value;

use super::StoreError;

/// Per-meter persisted state (daily baselines and reset dates), kept as a
/// small YAML document next to the configuration.
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new<P: AsRef<Path>>(state_dir: P, meter_name: &str) -> Self {
        StateFile {
            path: state_dir.as_ref().join(format!("{}.yaml", meter_name)),
        }
    }

    /// Load the stored values. A missing file is a fresh meter, not an error.
    pub fn load(&self) -> HashMap<String, Value> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => {
                debug!("No state file at {:?}, starting empty", self.path);
                return HashMap::new();
            }
        };

        match serde_yml::from_str(&contents) {
            Ok(values) => values,
            Err(e) => {
                error!("State file {:?} is unreadable, starting empty: {e}", self.path);
                HashMap::new()
            }
        }
    }

    pub fn save(&self, values: &HashMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Persistence(format!("creating {:?}: {e}", parent)))?;
        }

        /* Keep the previous state around in case the write goes wrong */
        if self.path.exists() {
            let backup = self.path.with_extension("yaml.bak");
            if fs::copy(&self.path, &backup).is_err() {
                error!("Backing up state file {:?} failed", self.path);
            }
        }

        let doc = serde_yml::to_string(values)
            .map_err(|e| StoreError::Persistence(format!("serializing state: {e}")))?;
        fs::write(&self.path, doc.as_bytes())
            .map_err(|e| StoreError::Persistence(format!("writing {:?}: {e}", self.path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path(), "garage");
        assert!(state.load().is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path(), "garage");

        let mut values = HashMap::new();
        values.insert("daily_import_baseline".to_string(), json!(1234.56));
        values.insert("last_daily_reset_import".to_string(), json!("2026-08-08T00:00:12+02:00"));
        state.save(&values).unwrap();

        let reloaded = StateFile::new(dir.path(), "garage").load();
        assert_eq!(reloaded.get("daily_import_baseline"), Some(&json!(1234.56)));
        assert_eq!(
            reloaded.get("last_daily_reset_import"),
            Some(&json!("2026-08-08T00:00:12+02:00"))
        );
    }

    #[test]
    fn test_save_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path(), "garage");

        let mut values = HashMap::new();
        values.insert("daily_import_baseline".to_string(), json!(1.0));
        state.save(&values).unwrap();
        values.insert("daily_import_baseline".to_string(), json!(2.0));
        state.save(&values).unwrap();

        assert!(dir.path().join("garage.yaml.bak").exists());
    }
}
