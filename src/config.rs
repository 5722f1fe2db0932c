use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub core_api: CoreApiConfig,

    #[validate(nested)]
    #[serde(default)]
    pub bus: BusConfig,

    #[validate(nested)]
    #[serde(default)]
    pub tsdb: TsdbConfig,

    #[validate(nested)]
    #[serde(default)]
    pub mpc: MpcConfig,

    #[validate(nested)]
    #[serde(default)]
    pub rtl: RtlConfig,

    #[validate(nested)]
    #[serde(default)]
    pub thermal: ThermalConfig,
}

/// Core API endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CoreApiConfig {
    #[validate(url)]
    pub base_url: String,

    #[serde(default = "default_request_timeout_s")]
    #[validate(range(min = 1, max = 120))]
    pub request_timeout_s: u64,

    /// Timeout for the RTL's consumption sample; kept well below one tick.
    #[serde(default = "default_consumption_timeout_ms")]
    #[validate(range(min = 50, max = 5000))]
    pub consumption_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Message bus (MQTT) configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BusConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_request_topic")]
    pub request_topic: String,

    #[serde(default = "default_ack_topic")]
    pub ack_topic: String,

    #[serde(default = "default_notify_topic")]
    pub notify_topic: String,
}

/// Time-series database (InfluxDB) configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TsdbConfig {
    #[validate(url)]
    pub url: String,

    pub org: String,
    pub token: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Disable writes entirely (useful on installs without an Influx instance).
    #[serde(default)]
    pub disabled: bool,
}

/// Planner configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MpcConfig {
    /// Priority tag applied to posted schedules.
    #[serde(default = "default_mpc_priority")]
    #[validate(range(min = 0, max = 255))]
    pub priority: u32,

    /// Node budget for the branch-and-bound layer when binaries are present.
    #[serde(default = "default_node_budget")]
    #[validate(range(min = 1, max = 100000))]
    pub node_budget: usize,
}

/// Real-time limiter configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RtlConfig {
    #[serde(default = "default_tick_period_s")]
    #[validate(range(min = 1, max = 60))]
    pub tick_period_s: u64,

    #[serde(default = "default_safety_margin_kw")]
    #[validate(range(min = 0.0, max = 10.0))]
    pub safety_margin_kw: f64,

    #[serde(default = "default_antirebound_default_s")]
    #[validate(range(min = 1, max = 3600))]
    pub antirebound_default_s: u64,

    #[serde(default = "default_antirebound_battery_s")]
    #[validate(range(min = 1, max = 3600))]
    pub antirebound_battery_s: u64,
}

/// Thermal model learner configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ThermalConfig {
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,

    #[serde(default = "default_ttl_h")]
    #[validate(range(min = 1, max = 168))]
    pub ttl_h: u64,

    /// How far back to pull telemetry when (re)learning.
    #[serde(default = "default_training_window_days")]
    #[validate(range(min = 1, max = 90))]
    pub training_window_days: u32,

    /// Sampling interval of the training traces, in minutes.
    #[serde(default = "default_training_step_minutes")]
    #[validate(range(min = 5, max = 120))]
    pub training_step_minutes: u32,

    /// Ridge penalties on the three matrices.
    #[serde(default = "default_ridge")]
    pub lambda_x: f64,
    #[serde(default = "default_ridge")]
    pub lambda_u: f64,
    #[serde(default = "default_ridge")]
    pub lambda_w: f64,
}

fn default_request_timeout_s() -> u64 { 10 }
fn default_consumption_timeout_ms() -> u64 { 800 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 250 }
fn default_client_id() -> String { "hem-controller".to_string() }
fn default_request_topic() -> String { "mpc".to_string() }
fn default_ack_topic() -> String { "mpc/ack".to_string() }
fn default_notify_topic() -> String { "notify".to_string() }
fn default_bucket() -> String { "hem".to_string() }
fn default_mpc_priority() -> u32 { 10 }
fn default_node_budget() -> usize { 500 }
fn default_tick_period_s() -> u64 { 1 }
fn default_safety_margin_kw() -> f64 { 0.5 }
fn default_antirebound_default_s() -> u64 { 5 }
fn default_antirebound_battery_s() -> u64 { 30 }
fn default_model_path() -> PathBuf { PathBuf::from("data/thermal_model.json") }
fn default_ttl_h() -> u64 { 24 }
fn default_training_window_days() -> u32 { 14 }
fn default_training_step_minutes() -> u32 { 30 }
fn default_ridge() -> f64 { 0.1 }

impl Default for CoreApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_s: default_request_timeout_s(),
            consumption_timeout_ms: default_consumption_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: default_client_id(),
            request_topic: default_request_topic(),
            ack_topic: default_ack_topic(),
            notify_topic: default_notify_topic(),
        }
    }
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8086".to_string(),
            org: "home".to_string(),
            token: String::new(),
            bucket: default_bucket(),
            disabled: false,
        }
    }
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self { priority: default_mpc_priority(), node_budget: default_node_budget() }
    }
}

impl Default for RtlConfig {
    fn default() -> Self {
        Self {
            tick_period_s: default_tick_period_s(),
            safety_margin_kw: default_safety_margin_kw(),
            antirebound_default_s: default_antirebound_default_s(),
            antirebound_battery_s: default_antirebound_battery_s(),
        }
    }
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            ttl_h: default_ttl_h(),
            training_window_days: default_training_window_days(),
            training_step_minutes: default_training_step_minutes(),
            lambda_x: default_ridge(),
            lambda_u: default_ridge(),
            lambda_w: default_ridge(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core_api: CoreApiConfig::default(),
            bus: BusConfig::default(),
            tsdb: TsdbConfig::default(),
            mpc: MpcConfig::default(),
            rtl: RtlConfig::default(),
            thermal: ThermalConfig::default(),
        }
    }
}

/// Well-known flat environment variables mapped onto the nested config tree.
const ENV_KEYS: &[(&str, &str)] = &[
    ("CORE_API_URL", "core_api__base_url"),
    ("BUS_HOST", "bus__host"),
    ("BUS_PORT", "bus__port"),
    ("BUS_TOPIC", "bus__request_topic"),
    ("TSDB_URL", "tsdb__url"),
    ("TSDB_ORG", "tsdb__org"),
    ("TSDB_TOKEN", "tsdb__token"),
    ("TSDB_BUCKET", "tsdb__bucket"),
    ("MPC_PRIORITY", "mpc__priority"),
    ("RTL_TICK_PERIOD_S", "rtl__tick_period_s"),
    ("RTL_SAFETY_MARGIN_KW", "rtl__safety_margin_kw"),
    ("RTL_ANTIREBOUND_DEFAULT_S", "rtl__antirebound_default_s"),
    ("RTL_ANTIREBOUND_BATTERY_S", "rtl__antirebound_battery_s"),
    ("THERMAL_MODEL_PATH", "thermal__model_path"),
    ("THERMAL_MODEL_TTL_H", "thermal__ttl_h"),
];

impl Config {
    /// Load configuration from `config/default.toml` and the environment.
    ///
    /// Flat variables from `ENV_KEYS` (e.g. `MPC_PRIORITY`) override the file;
    /// nested overrides use the `HEM__` prefix (`HEM__RTL__TICK_PERIOD_S`).
    pub fn load() -> Result<Self> {
        let names: Vec<&str> = ENV_KEYS.iter().map(|(name, _)| *name).collect();
        let flat_env = Env::raw()
            .only(&names)
            .map(|key| {
                ENV_KEYS
                    .iter()
                    .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                    .map(|(_, target)| (*target).into())
                    .unwrap_or_else(|| key.as_str().to_owned().into())
            })
            .split("__");

        let config: Config = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(flat_env)
            .merge(Env::prefixed("HEM__").split("__"))
            .extract()
            .context("failed to parse configuration")?;

        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rtl.tick_period_s, 1);
        assert!((config.rtl.safety_margin_kw - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.rtl.antirebound_default_s, 5);
        assert_eq!(config.rtl.antirebound_battery_s, 30);
        assert_eq!(config.thermal.ttl_h, 24);
    }

    #[test]
    fn validation_rejects_zero_tick() {
        let mut config = Config::default();
        config.rtl.tick_period_s = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bus_defaults_point_at_mpc_topic() {
        let config = Config::default();
        assert_eq!(config.bus.request_topic, "mpc");
        assert_eq!(config.bus.ack_topic, "mpc/ack");
    }
}
