//! Thermal-model learner.
//!
//! Fits the zone state-space matrices from historical telemetry with a
//! regularized least-squares program, persists the result as a JSON
//! artifact, and decides when a relearn is due. Learning failures are never
//! fatal: the planner falls back to the previous artifact or a conservative
//! default model.

pub mod fit;
pub mod store;

use chrono::{DateTime, Duration, Utc};
use ndarray::Array2;
use tracing::{info, warn};

use crate::config::ThermalConfig;
use crate::coreapi::CoreApi;
use crate::domain::{ControlError, Device, DeviceSpec, Horizon, ThermalModel};

pub use fit::{fit_thermal_model, FitOptions};
pub use store::ModelStore;

/// Return a usable thermal model for the given space-heating device,
/// relearning if the persisted artifact is missing, stale, or corrupt.
///
/// This function never fails; at worst it returns the documented default
/// diagonal-stable model.
pub async fn ensure_fresh_model(
    core: &dyn CoreApi,
    device: &Device,
    cfg: &ThermalConfig,
    now: DateTime<Utc>,
) -> ThermalModel {
    let store = ModelStore::new(cfg.model_path.clone());
    let ttl = Duration::hours(cfg.ttl_h as i64);

    // Artifact I/O stays off the async workers so the RTL tick is never
    // delayed behind a slow disk.
    let load_store = store.clone();
    let loaded = tokio::task::spawn_blocking(move || load_store.load())
        .await
        .unwrap_or_else(|e| Err(ControlError::ModelLoadFailed(format!("load task: {e}"))));
    let previous = match loaded {
        Ok(model) => {
            if model.is_fresh(now, ttl) && model.validate().is_ok() {
                return model;
            }
            info!(
                learned_at = %model.learned_at,
                "thermal model artifact is stale, relearning"
            );
            Some(model)
        }
        Err(e) => {
            warn!(error = %e, "thermal model artifact unavailable, relearning");
            None
        }
    };

    match relearn(core, device, cfg, now).await {
        Ok(model) => {
            let save_store = store.clone();
            let to_save = model.clone();
            let saved = tokio::task::spawn_blocking(move || save_store.save(&to_save))
                .await
                .unwrap_or_else(|e| Err(ControlError::WriteFailed(format!("save task: {e}"))));
            if let Err(e) = saved {
                warn!(error = %e, "failed to persist relearned thermal model");
            }
            model
        }
        Err(e) => {
            warn!(error = %e, "thermal model learning failed, falling back");
            match previous {
                Some(model) => model,
                None => {
                    let (zones, heaters, channels) = shape_of(device);
                    ThermalModel::fallback(zones, heaters, channels, now)
                }
            }
        }
    }
}

fn shape_of(device: &Device) -> (usize, usize, usize) {
    match &device.spec {
        DeviceSpec::SpaceHeating(params) => (params.zones, params.heaters, params.weather_channels),
        _ => (1, 1, 1),
    }
}

/// Pull aligned telemetry traces and fit a fresh model.
async fn relearn(
    core: &dyn CoreApi,
    device: &Device,
    cfg: &ThermalConfig,
    now: DateTime<Utc>,
) -> Result<ThermalModel, ControlError> {
    let (zones, heaters, channels) = shape_of(device);

    let step = Duration::minutes(cfg.training_step_minutes as i64);
    let span = Duration::days(cfg.training_window_days as i64);
    let stop = now - Duration::seconds(now.timestamp() % step.num_seconds());
    let grid = Horizon::new(stop - span, stop, step)
        .map_err(|e| ControlError::ModelLearnFailed(e.to_string()))?;

    let temps = core
        .historic_channels("zone_temperature", Some(&device.entity_id), grid.start(), grid.stop())
        .await
        .map_err(|e| ControlError::ModelLearnFailed(format!("zone temperatures: {e:#}")))?;
    let powers = core
        .historic_channels("heater_power", Some(&device.entity_id), grid.start(), grid.stop())
        .await
        .map_err(|e| ControlError::ModelLearnFailed(format!("heater powers: {e:#}")))?;

    let mut weather = Vec::with_capacity(channels);
    for variable in ["temperature", "irradiance"].iter().take(channels) {
        let series = core
            .weather_historic(variable, grid.start(), grid.stop())
            .await
            .map_err(|e| ControlError::ModelLearnFailed(format!("weather {variable}: {e:#}")))?;
        weather.push(series);
    }

    if temps.len() != zones || powers.len() != heaters {
        return Err(ControlError::ModelLearnFailed(format!(
            "telemetry channel counts ({}/{}) do not match device shape ({zones}/{heaters})",
            temps.len(),
            powers.len()
        )));
    }

    let sample = |series: &crate::domain::TimeSeries| -> Result<Vec<f64>, ControlError> {
        series
            .sample_on(&grid)
            .map_err(|e| ControlError::ModelLearnFailed(format!("trace gap: {e}")))
    };

    let mut x = Array2::zeros((zones, grid.steps()));
    for (z, series) in temps.iter().enumerate() {
        for (m, value) in sample(series)?.into_iter().enumerate() {
            x[(z, m)] = value;
        }
    }
    let mut u = Array2::zeros((heaters, grid.steps()));
    for (h, series) in powers.iter().enumerate() {
        for (m, value) in sample(series)?.into_iter().enumerate() {
            u[(h, m)] = value;
        }
    }
    let mut w = Array2::zeros((channels, grid.steps()));
    for (d, series) in weather.iter().enumerate() {
        for (m, value) in sample(series)?.into_iter().enumerate() {
            w[(d, m)] = value;
        }
    }

    let options = FitOptions {
        lambda_x: cfg.lambda_x,
        lambda_u: cfg.lambda_u,
        lambda_w: cfg.lambda_w,
    };
    // One QP per zone: solver work runs off the async runtime, same as the
    // planner's solve.
    tokio::task::spawn_blocking(move || {
        fit_thermal_model(x.view(), u.view(), w.view(), &options, now)
    })
    .await
    .map_err(|e| ControlError::ModelLearnFailed(format!("fit task: {e}")))?
}
