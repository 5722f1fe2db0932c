//! Core API access.
//!
//! Everything the controller knows about the building comes through this
//! interface: device inventory, measurements, preferences, forecasts, and
//! the write paths for setpoints and schedules. The trait exists so the
//! planner, RTL, and dispatcher can be exercised against in-memory fakes.

mod http;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Device, DispatchSchedule, TimeSeries};

pub use http::HttpCoreApi;

#[async_trait]
pub trait CoreApi: Send + Sync {
    /// `GET /devices`, filtered to the supported kinds.
    async fn devices(&self) -> Result<Vec<Device>>;

    /// `GET /devices/state/{id}?field=...` returning a scalar.
    async fn device_state(&self, entity_id: &str, field: &str) -> Result<f64>;

    /// `GET /devices/state/{id}?field=...` returning a vector (one value per
    /// zone or channel).
    async fn device_state_vector(&self, entity_id: &str, field: &str) -> Result<Vec<f64>>;

    /// `GET /building/consumption`: current total building draw, kW.
    /// Single attempt with a short timeout; the RTL skips a tick on failure.
    async fn building_consumption_kw(&self) -> Result<f64>;

    /// `GET /preferences?type=...&device_id=...`: one series.
    async fn preference(
        &self,
        kind: &str,
        entity_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries>;

    /// `GET /preferences` for channelized preferences (per-zone setpoints,
    /// occupancy). Channels come back keyed `"0"`, `"1"`, ....
    async fn preference_channels(
        &self,
        kind: &str,
        entity_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>>;

    /// `GET /historic?type=...[&device_id=...]`, channelized.
    async fn historic_channels(
        &self,
        kind: &str,
        entity_id: Option<&str>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>>;

    /// `GET /weather/historic?variable=...`.
    async fn weather_historic(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries>;

    /// `GET /weather/forecast?variable=...`.
    async fn weather_forecast(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries>;

    /// `GET /forecast/non_controllable?variable=...`.
    async fn non_controllable_forecast(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries>;

    /// `POST /devices/setpoint/{id}` with `{"setpoint": value}`.
    async fn set_setpoint(&self, entity_id: &str, setpoint: f64) -> Result<()>;

    /// `POST /devices/schedule/{priority}` with the schedule JSON.
    async fn post_schedule(&self, schedule: &DispatchSchedule) -> Result<()>;
}
