use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A controllable device as reported by the Core API.
///
/// Devices are immutable within a planning cycle; the planner and the RTL
/// both work from the same inventory snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub entity_id: String,

    /// Higher priority means the device is curtailed later.
    pub priority: i64,

    pub critical_action: CriticalAction,

    #[serde(flatten)]
    pub spec: DeviceSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    SpaceHeating,
    WaterHeater,
    ElectricStorage,
    ElectricVehicleV1g,
}

/// Minimum-impact fallback applied by the RTL when curtailing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriticalAction {
    /// Command zero power draw.
    PowerOff,
    /// Drop the thermostat to the lowest allowed setpoint.
    MinimumSetpoint { setpoint_c: f64 },
    /// Reduce to a floor power, in kW.
    MinimumPower { power_kw: f64 },
}

impl CriticalAction {
    /// The scalar written through `POST /devices/setpoint/{id}`.
    pub fn setpoint_value(&self) -> f64 {
        match self {
            CriticalAction::PowerOff => 0.0,
            CriticalAction::MinimumSetpoint { setpoint_c } => *setpoint_c,
            CriticalAction::MinimumPower { power_kw } => power_kw * 1000.0,
        }
    }
}

/// Kind-specific static parameters, tagged with the device kind on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSpec {
    SpaceHeating(SpaceHeatingParams),
    WaterHeater(WaterHeaterParams),
    ElectricStorage(StorageParams),
    ElectricVehicleV1g(EvParams),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self.spec {
            DeviceSpec::SpaceHeating(_) => DeviceKind::SpaceHeating,
            DeviceSpec::WaterHeater(_) => DeviceKind::WaterHeater,
            DeviceSpec::ElectricStorage(_) => DeviceKind::ElectricStorage,
            DeviceSpec::ElectricVehicleV1g(_) => DeviceKind::ElectricVehicleV1g,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceHeatingParams {
    pub zones: usize,
    pub heaters: usize,

    /// Total electric heating capacity; each heater is capped at
    /// `max_total_power_kw / heaters`.
    #[serde(default = "default_sh_total_kw")]
    pub max_total_power_kw: f64,

    /// Per-heater ramp limit between consecutive steps, in kW.
    #[serde(default = "default_sh_ramp_kw")]
    pub ramp_kw_per_step: f64,

    #[serde(default = "default_sh_t_min")]
    pub t_min_c: f64,
    #[serde(default = "default_sh_t_max")]
    pub t_max_c: f64,

    /// Comfort normalisation band, in kelvin: one band of deviation from
    /// the desired temperature counts as one unit of discomfort.
    #[serde(default = "default_sh_band")]
    pub comfort_band_c: f64,

    /// Weather disturbance channels the thermal model is driven by:
    /// 1 = outdoor temperature, 2 = temperature + irradiance.
    #[serde(default = "default_sh_weather_channels")]
    pub weather_channels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterHeaterParams {
    pub volume_l: f64,
    pub power_max_kw: f64,

    #[serde(default = "default_wh_t_min")]
    pub t_min_c: f64,
    #[serde(default = "default_wh_t_max")]
    pub t_max_c: f64,
    #[serde(default = "default_wh_t_inlet")]
    pub t_inlet_c: f64,

    /// Standing losses through the tank envelope, in W/K.
    #[serde(default = "default_wh_loss")]
    pub standing_loss_w_per_k: f64,

    #[serde(default = "default_wh_band")]
    pub comfort_band_c: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageParams {
    pub capacity_wh: f64,
    pub e_min_wh: f64,
    pub e_max_wh: f64,
    pub p_charge_max_kw: f64,
    pub p_discharge_max_kw: f64,

    #[serde(default = "default_efficiency")]
    pub eta_charge: f64,
    #[serde(default = "default_efficiency")]
    pub eta_discharge: f64,

    /// Per-step self-discharge retention factor (1.0 = lossless holding).
    #[serde(default = "default_retention")]
    pub retention: f64,

    /// Optional terminal energy floor, in Wh.
    #[serde(default)]
    pub e_final_wh: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvParams {
    pub capacity_wh: f64,
    pub e_min_wh: f64,
    pub e_max_wh: f64,

    /// Charger power when the gate is closed, in kW. V1G: charge only.
    pub p_max_kw: f64,

    #[serde(default = "default_efficiency")]
    pub eta_charge: f64,
    #[serde(default = "default_retention")]
    pub retention: f64,

    #[serde(default)]
    pub e_final_wh: Option<f64>,
}

fn default_sh_total_kw() -> f64 { 16.0 }
fn default_sh_ramp_kw() -> f64 { 2.0 }
fn default_sh_t_min() -> f64 { 17.0 }
fn default_sh_t_max() -> f64 { 25.0 }
fn default_sh_band() -> f64 { 0.5 }
fn default_sh_weather_channels() -> usize { 1 }
fn default_wh_t_min() -> f64 { 45.0 }
fn default_wh_t_max() -> f64 { 65.0 }
fn default_wh_t_inlet() -> f64 { 12.0 }
fn default_wh_loss() -> f64 { 2.0 }
fn default_wh_band() -> f64 { 2.0 }
fn default_efficiency() -> f64 { 0.95 }
fn default_retention() -> f64 { 1.0 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_roundtrips_with_flattened_kind() {
        let json = serde_json::json!({
            "entity_id": "wh-1",
            "priority": 1,
            "critical_action": {"type": "power_off"},
            "kind": "water_heater",
            "volume_l": 270.0,
            "power_max_kw": 4.5
        });
        let device: Device = serde_json::from_value(json).unwrap();
        assert_eq!(device.kind(), DeviceKind::WaterHeater);
        match &device.spec {
            DeviceSpec::WaterHeater(params) => {
                assert_eq!(params.volume_l, 270.0);
                assert_eq!(params.t_inlet_c, 12.0);
            }
            other => panic!("unexpected spec: {other:?}"),
        }

        let back = serde_json::to_value(&device).unwrap();
        assert_eq!(back["kind"], "water_heater");
        assert_eq!(back["entity_id"], "wh-1");
    }

    #[test]
    fn kind_parses_from_wire_name() {
        let kind: DeviceKind = "electric_vehicle_v1g".parse().unwrap();
        assert_eq!(kind, DeviceKind::ElectricVehicleV1g);
        assert_eq!(DeviceKind::SpaceHeating.to_string(), "space_heating");
    }

    #[test]
    fn critical_action_setpoint_values() {
        assert_eq!(CriticalAction::PowerOff.setpoint_value(), 0.0);
        assert_eq!(
            CriticalAction::MinimumSetpoint { setpoint_c: 15.0 }.setpoint_value(),
            15.0
        );
        assert_eq!(
            CriticalAction::MinimumPower { power_kw: 1.2 }.setpoint_value(),
            1200.0
        );
    }
}
