//! Persistence of the thermal model artifact.
//!
//! Single JSON file at `THERMAL_MODEL_PATH`. The learner is the only
//! writer; the planner loads at most once per cycle.

use std::fs;
use std::path::PathBuf;

use crate::domain::thermal::ThermalModelArtifact;
use crate::domain::{ControlError, ThermalModel};

#[derive(Clone)]
pub struct ModelStore {
    path: PathBuf,
}

impl ModelStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load(&self) -> Result<ThermalModel, ControlError> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            ControlError::ModelLoadFailed(format!("{}: {e}", self.path.display()))
        })?;
        let artifact: ThermalModelArtifact = serde_json::from_str(&raw).map_err(|e| {
            ControlError::ModelLoadFailed(format!("{}: {e}", self.path.display()))
        })?;
        ThermalModel::try_from(artifact).map_err(ControlError::ModelLoadFailed)
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, model: &ThermalModel) -> Result<(), ControlError> {
        let artifact = ThermalModelArtifact::from(model);
        let json = serde_json::to_string_pretty(&artifact)
            .map_err(|e| ControlError::WriteFailed(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ControlError::WriteFailed(format!("{}: {e}", parent.display())))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .map_err(|e| ControlError::WriteFailed(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ControlError::WriteFailed(format!("{}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hem-model-store-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn save_then_load_roundtrips() {
        let path = temp_path("roundtrip");
        let store = ModelStore::new(path.clone());
        let model = ThermalModel::fallback(2, 2, 1, Utc::now());

        store.save(&model).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.ax, model.ax);
        assert_eq!(loaded.au, model.au);
        assert_eq!(loaded.learned_at, model.learned_at);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn missing_file_is_a_load_failure() {
        let store = ModelStore::new(temp_path("missing-nonexistent"));
        assert!(matches!(
            store.load(),
            Err(ControlError::ModelLoadFailed(_))
        ));
    }

    #[test]
    fn corrupt_artifact_is_a_load_failure() {
        let path = temp_path("corrupt");
        fs::write(&path, "{not json").unwrap();
        let store = ModelStore::new(path.clone());
        assert!(matches!(
            store.load(),
            Err(ControlError::ModelLoadFailed(_))
        ));
        let _ = fs::remove_file(path);
    }
}
