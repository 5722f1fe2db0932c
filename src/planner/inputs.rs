//! Assembly of per-device planner inputs from Core API state and
//! preferences.
//!
//! Only the non-controllable load forecast and (for space heating) the
//! weather forecast are hard requirements; missing preference series fall
//! back to the device's configured defaults with a warning, so one flaky
//! preference store cannot take out the whole cycle.

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use crate::config::Config;
use crate::coreapi::CoreApi;
use crate::domain::{ControlError, Device, DeviceSpec, Horizon, TimeSeries};
use crate::learner;
use crate::models::{
    EvInputs, ModelInputs, SpaceHeatingInputs, StorageInputs, WaterHeaterInputs,
};

/// Sample a fetched series onto the grid, or fall back to a constant.
fn sample_or(
    fetched: Result<TimeSeries>,
    horizon: &Horizon,
    fallback: f64,
    what: &str,
) -> Vec<f64> {
    match fetched.and_then(|series| Ok(series.sample_on(horizon)?)) {
        Ok(values) => values,
        Err(e) => {
            warn!(error = %e, what, fallback, "preference unavailable, using fallback");
            vec![fallback; horizon.steps()]
        }
    }
}

fn state_or(fetched: Result<f64>, fallback: f64, lo: f64, hi: f64, what: &str) -> f64 {
    match fetched {
        Ok(value) if value.is_finite() => value.clamp(lo, hi),
        Ok(value) => {
            warn!(what, value, "non-finite device state, using fallback");
            fallback
        }
        Err(e) => {
            warn!(error = %e, what, fallback, "device state unavailable, using fallback");
            fallback
        }
    }
}

pub async fn assemble(
    core: &dyn CoreApi,
    cfg: &Config,
    device: &Device,
    horizon: &Horizon,
) -> Result<ModelInputs, ControlError> {
    let id = &device.entity_id;
    let (start, stop) = (horizon.start(), horizon.stop());

    match &device.spec {
        DeviceSpec::WaterHeater(params) => {
            let mid = 0.5 * (params.t_min_c + params.t_max_c);
            let t_initial = state_or(
                core.device_state(id, "temperature").await,
                mid,
                params.t_min_c,
                params.t_max_c,
                "tank temperature",
            );
            Ok(ModelInputs::WaterHeater(WaterHeaterInputs {
                t_initial_c: t_initial,
                draw_l_per_h: sample_or(
                    core.preference("hot_water_draw", id, start, stop).await,
                    horizon,
                    0.0,
                    "hot water draw",
                ),
                ambient_c: sample_or(
                    core.preference("ambient_temperature", id, start, stop).await,
                    horizon,
                    20.0,
                    "tank ambient temperature",
                ),
                desired_c: sample_or(
                    core.preference("setpoint", id, start, stop).await,
                    horizon,
                    mid,
                    "tank setpoint",
                ),
            }))
        }

        DeviceSpec::ElectricStorage(params) => {
            let mid = 0.5 * (params.e_min_wh + params.e_max_wh);
            Ok(ModelInputs::Storage(StorageInputs {
                e_initial_wh: state_or(
                    core.device_state(id, "residual_energy").await,
                    mid,
                    params.e_min_wh,
                    params.e_max_wh,
                    "battery residual energy",
                ),
                e_desired_wh: sample_or(
                    core.preference("soc_target", id, start, stop).await,
                    horizon,
                    mid,
                    "battery SoC target",
                ),
                e_final_wh: None,
            }))
        }

        DeviceSpec::ElectricVehicleV1g(params) => {
            let mid = 0.5 * (params.e_min_wh + params.e_max_wh);
            let connected = sample_or(
                core.preference("connection", id, start, stop).await,
                horizon,
                // Unknown plug state: plan no charging rather than phantom load.
                0.0,
                "EV connection profile",
            );
            Ok(ModelInputs::Ev(EvInputs {
                e_initial_wh: state_or(
                    core.device_state(id, "residual_energy").await,
                    mid,
                    params.e_min_wh,
                    params.e_max_wh,
                    "EV residual energy",
                ),
                connected: connected.into_iter().map(|v| v > 0.5).collect(),
                e_desired_wh: sample_or(
                    core.preference("soc_target", id, start, stop).await,
                    horizon,
                    params.e_max_wh,
                    "EV SoC target",
                ),
                e_final_wh: None,
            }))
        }

        DeviceSpec::SpaceHeating(params) => {
            let thermal = learner::ensure_fresh_model(core, device, &cfg.thermal, Utc::now()).await;

            let mid = 0.5 * (params.t_min_c + params.t_max_c);
            let t_initial = match core.device_state_vector(id, "zone_temperatures").await {
                Ok(values) if values.len() == params.zones => values
                    .into_iter()
                    .map(|t| t.clamp(params.t_min_c, params.t_max_c))
                    .collect(),
                Ok(values) => {
                    warn!(
                        got = values.len(),
                        zones = params.zones,
                        "zone temperature vector has wrong length, using fallback"
                    );
                    vec![mid; params.zones]
                }
                Err(e) => {
                    warn!(error = %e, "zone temperatures unavailable, using fallback");
                    vec![mid; params.zones]
                }
            };

            let desired_c = channels_or(
                core.preference_channels("zone_setpoints", id, start, stop).await,
                horizon,
                params.zones,
                21.0,
                "zone setpoints",
            );
            let occupancy = channels_or(
                core.preference_channels("occupancy", id, start, stop).await,
                horizon,
                params.zones,
                1.0,
                "zone occupancy",
            );

            // Weather is a required planner input when space heating runs.
            let mut disturbances = Vec::with_capacity(params.weather_channels);
            for variable in ["temperature", "irradiance"].iter().take(params.weather_channels) {
                let series = core
                    .weather_forecast(variable, start, stop)
                    .await
                    .map_err(|e| ControlError::DataUnavailable(format!("weather: {e:#}")))?;
                disturbances.push(series.sample_on(horizon)?);
            }

            Ok(ModelInputs::SpaceHeating(SpaceHeatingInputs {
                t_initial_c: t_initial,
                desired_c,
                occupancy,
                disturbances,
                thermal,
            }))
        }
    }
}

/// Sample channelized preferences, padding or falling back per zone.
fn channels_or(
    fetched: Result<Vec<TimeSeries>>,
    horizon: &Horizon,
    zones: usize,
    fallback: f64,
    what: &str,
) -> Vec<Vec<f64>> {
    let channels = match fetched {
        Ok(channels) => channels,
        Err(e) => {
            warn!(error = %e, what, "channelized preference unavailable, using fallback");
            Vec::new()
        }
    };
    (0..zones)
        .map(|z| match channels.get(z) {
            Some(series) => match series.sample_on(horizon) {
                Ok(values) => values,
                Err(e) => {
                    warn!(error = %e, what, zone = z, "gap in preference, using fallback");
                    vec![fallback; horizon.steps()]
                }
            },
            None => vec![fallback; horizon.steps()],
        })
        .collect()
}
