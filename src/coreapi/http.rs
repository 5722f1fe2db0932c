use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CoreApiConfig;
use crate::domain::{Device, DispatchSchedule, TimeSeries};

use super::CoreApi;

/// Core API client over HTTP/JSON.
///
/// Transient failures (connect errors, 5xx) are retried with a short fixed
/// backoff, bounded by `max_retries`; the caller maps the final error to
/// `DATA_UNAVAILABLE` for the affected cycle.
pub struct HttpCoreApi {
    client: Client,
    base_url: String,
    consumption_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpCoreApi {
    pub fn new(cfg: &CoreApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_s))
            .build()
            .context("failed to build Core API HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            consumption_timeout: Duration::from_millis(cfg.consumption_timeout_ms),
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        })
    }

    async fn get_value(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.client.get(&url).query(query).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Value>()
                        .await
                        .with_context(|| format!("invalid JSON from {url}"));
                }
                Ok(response) if response.status().is_server_error() => {
                    if attempt > self.max_retries {
                        bail!("{url} failed with {} after {attempt} attempts", response.status());
                    }
                    debug!(%url, status = %response.status(), attempt, "retrying Core API call");
                }
                Ok(response) => {
                    bail!("{url} failed with {}", response.status());
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(e).with_context(|| format!("{url} unreachable"));
                    }
                    debug!(%url, error = %e, attempt, "retrying Core API call");
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.client.post(&url).json(body).send().await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_server_error() => {
                    if attempt > self.max_retries {
                        bail!("{url} failed with {} after {attempt} attempts", response.status());
                    }
                }
                Ok(response) => bail!("{url} failed with {}", response.status()),
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(e).with_context(|| format!("{url} unreachable"));
                    }
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

/// Accept a bare number or `{"value": ...}`.
fn parse_scalar(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().context("non-finite number"),
        Value::Object(map) => map
            .get("value")
            .and_then(Value::as_f64)
            .context("object response lacks a numeric \"value\""),
        other => bail!("expected a scalar, got {other}"),
    }
}

/// Accept `{"ts": v, ...}` (one channel) or `{"0": {...}, "1": {...}}`
/// (channels keyed by index).
fn parse_channels(value: Value) -> Result<Vec<TimeSeries>> {
    let Value::Object(map) = &value else {
        bail!("expected an object of samples or channels");
    };
    let channelized = map.values().all(|v| v.is_object()) && !map.is_empty();
    if channelized {
        let mut keyed: Vec<(usize, TimeSeries)> = Vec::with_capacity(map.len());
        for (key, channel) in map {
            let index: usize =
                key.parse().with_context(|| format!("non-numeric channel key {key:?}"))?;
            let series: TimeSeries = serde_json::from_value(channel.clone())
                .with_context(|| format!("channel {key} is not a time series"))?;
            keyed.push((index, series));
        }
        keyed.sort_by_key(|(index, _)| *index);
        Ok(keyed.into_iter().map(|(_, series)| series).collect())
    } else {
        let series: TimeSeries =
            serde_json::from_value(value).context("response is not a time series")?;
        Ok(vec![series])
    }
}

fn range_query(start: DateTime<Utc>, stop: DateTime<Utc>) -> [(&'static str, String); 2] {
    [("start", start.to_rfc3339()), ("stop", stop.to_rfc3339())]
}

#[async_trait]
impl CoreApi for HttpCoreApi {
    async fn devices(&self) -> Result<Vec<Device>> {
        let value = self.get_value("/devices", &[]).await?;
        let Value::Array(items) = value else {
            bail!("/devices did not return an array");
        };
        let mut devices = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<Device>(item.clone()) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    // Unknown kinds are expected as the Core API grows.
                    warn!(error = %e, "skipping unsupported device entry");
                }
            }
        }
        Ok(devices)
    }

    async fn device_state(&self, entity_id: &str, field: &str) -> Result<f64> {
        let value = self
            .get_value(
                &format!("/devices/state/{entity_id}"),
                &[("field", field.to_string())],
            )
            .await?;
        parse_scalar(&value).with_context(|| format!("state {field} of {entity_id}"))
    }

    async fn device_state_vector(&self, entity_id: &str, field: &str) -> Result<Vec<f64>> {
        let value = self
            .get_value(
                &format!("/devices/state/{entity_id}"),
                &[("field", field.to_string())],
            )
            .await?;
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_f64().context("non-numeric entry in state vector"))
                .collect(),
            other => Ok(vec![parse_scalar(&other)
                .with_context(|| format!("state {field} of {entity_id}"))?]),
        }
    }

    async fn building_consumption_kw(&self) -> Result<f64> {
        // Deliberately bypasses the retry loop: a stale sample is worse than
        // a skipped RTL tick.
        let url = format!("{}/building/consumption", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.consumption_timeout)
            .send()
            .await
            .with_context(|| format!("{url} unreachable"))?;
        if !response.status().is_success() {
            bail!("{url} failed with {}", response.status());
        }
        let value = response.json::<Value>().await.context("consumption response")?;
        parse_scalar(&value)
    }

    async fn preference(
        &self,
        kind: &str,
        entity_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries> {
        let [start_q, stop_q] = range_query(start, stop);
        let value = self
            .get_value(
                "/preferences",
                &[("type", kind.to_string()), ("device_id", entity_id.to_string()), start_q, stop_q],
            )
            .await?;
        serde_json::from_value(value).with_context(|| format!("preference {kind} of {entity_id}"))
    }

    async fn preference_channels(
        &self,
        kind: &str,
        entity_id: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        let [start_q, stop_q] = range_query(start, stop);
        let value = self
            .get_value(
                "/preferences",
                &[("type", kind.to_string()), ("device_id", entity_id.to_string()), start_q, stop_q],
            )
            .await?;
        parse_channels(value).with_context(|| format!("preference {kind} of {entity_id}"))
    }

    async fn historic_channels(
        &self,
        kind: &str,
        entity_id: Option<&str>,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>> {
        let [start_q, stop_q] = range_query(start, stop);
        let mut query = vec![("type", kind.to_string()), start_q, stop_q];
        if let Some(entity_id) = entity_id {
            query.push(("device_id", entity_id.to_string()));
        }
        let value = self.get_value("/historic", &query).await?;
        parse_channels(value).with_context(|| format!("historic {kind}"))
    }

    async fn weather_historic(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries> {
        let [start_q, stop_q] = range_query(start, stop);
        let value = self
            .get_value("/weather/historic", &[("variable", variable.to_string()), start_q, stop_q])
            .await?;
        serde_json::from_value(value).with_context(|| format!("historic weather {variable}"))
    }

    async fn weather_forecast(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries> {
        let [start_q, stop_q] = range_query(start, stop);
        let value = self
            .get_value("/weather/forecast", &[("variable", variable.to_string()), start_q, stop_q])
            .await?;
        serde_json::from_value(value).with_context(|| format!("weather forecast {variable}"))
    }

    async fn non_controllable_forecast(
        &self,
        variable: &str,
        start: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<TimeSeries> {
        let [start_q, stop_q] = range_query(start, stop);
        let value = self
            .get_value(
                "/forecast/non_controllable",
                &[("variable", variable.to_string()), start_q, stop_q],
            )
            .await?;
        serde_json::from_value(value).context("non-controllable forecast")
    }

    async fn set_setpoint(&self, entity_id: &str, setpoint: f64) -> Result<()> {
        // Single attempt: the RTL moves on to the next device on the next
        // tick rather than hammering a failing endpoint.
        let url = format!("{}/devices/setpoint/{entity_id}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "setpoint": setpoint }))
            .send()
            .await
            .with_context(|| format!("{url} unreachable"))?;
        if !response.status().is_success() {
            bail!("{url} failed with {}", response.status());
        }
        Ok(())
    }

    async fn post_schedule(&self, schedule: &DispatchSchedule) -> Result<()> {
        let body = serde_json::to_value(schedule).context("schedule serialization")?;
        self.post_json(&format!("/devices/schedule/{}", schedule.priority), &body).await
    }
}
