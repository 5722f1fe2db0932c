//! Result mirror into the time-series database.
//!
//! Every planning cycle writes one `dispatch` measurement per device and
//! step, tagged with the entity and kind. Failures here never fail the
//! cycle; the schedule POSTed to the Core API is authoritative.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream;
use influxdb2::models::DataPoint;
use influxdb2::Client;
use tracing::debug;

use crate::config::TsdbConfig;
use crate::domain::{ControlSignal, DispatchSchedule};

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write_schedule(&self, schedule: &DispatchSchedule) -> Result<()>;
}

pub struct InfluxSink {
    client: Client,
    bucket: String,
}

impl InfluxSink {
    pub fn new(cfg: &TsdbConfig) -> Self {
        Self {
            client: Client::new(cfg.url.clone(), cfg.org.clone(), cfg.token.clone()),
            bucket: cfg.bucket.clone(),
        }
    }
}

#[async_trait]
impl ResultSink for InfluxSink {
    async fn write_schedule(&self, schedule: &DispatchSchedule) -> Result<()> {
        let mut points = Vec::new();
        for series in &schedule.series {
            for (&at, &value) in series.control.iter() {
                let mut builder = DataPoint::builder("dispatch")
                    .tag("entity_id", series.entity_id.as_str())
                    .tag("kind", series.kind.to_string())
                    .timestamp(at.timestamp_nanos_opt().unwrap_or_default());
                builder = match series.signal {
                    ControlSignal::PowerW => builder.field("power_w", value),
                    ControlSignal::SetpointC => builder.field("setpoint_c", value),
                };
                if let Some(temps) = &series.temperature_c {
                    if let Some(temp) = temps.value_at(at) {
                        builder = builder.field("temperature_c", temp);
                    }
                }
                if let Some(soc) = &series.soc_wh {
                    if let Some(soc) = soc.value_at(at) {
                        builder = builder.field("soc_wh", soc);
                    }
                }
                points.push(builder.build().context("building data point")?);
            }
        }

        debug!(points = points.len(), bucket = %self.bucket, "writing dispatch series");
        self.client
            .write(&self.bucket, stream::iter(points))
            .await
            .context("influx write failed")
    }
}

/// Sink for installs without a TSDB (and for tests).
pub struct NullSink;

#[async_trait]
impl ResultSink for NullSink {
    async fn write_schedule(&self, _schedule: &DispatchSchedule) -> Result<()> {
        Ok(())
    }
}
