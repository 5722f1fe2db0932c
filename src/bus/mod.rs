//! Message bus integration (MQTT).
//!
//! One inbound topic (`mpc`) carries planning requests; acks and user
//! notifications go out on their own topics. The event loop runs in a
//! background task and feeds parsed requests into a channel, so the
//! dispatcher never touches the transport directly.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::domain::TimeSeries;

/// An incoming message on the request topic, decoded as far as JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanningRequest {
    #[serde(default)]
    pub params: Option<Value>,
}

/// Parameters of a non-empty planning request.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanningParams {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Step length, seconds.
    pub interval: i64,

    #[serde(default)]
    pub price_profile: TimeSeries,
    #[serde(default)]
    pub power_limit: TimeSeries,

    #[serde(default)]
    pub space_heating: bool,
    #[serde(default)]
    pub electric_storage: bool,
    #[serde(default)]
    pub electric_vehicle: bool,
    #[serde(default)]
    pub water_heater: bool,
}

/// What a request asks the dispatcher to do.
#[derive(Debug)]
pub enum RequestKind {
    /// Empty or missing params: stop the RTL.
    Stop,
    Plan(Box<PlanningParams>),
}

impl PlanningRequest {
    pub fn interpret(&self) -> Result<RequestKind> {
        match &self.params {
            None | Some(Value::Null) => Ok(RequestKind::Stop),
            Some(Value::Object(map)) if map.is_empty() => Ok(RequestKind::Stop),
            Some(params) => {
                let params: PlanningParams = serde_json::from_value(params.clone())
                    .context("malformed planning parameters")?;
                Ok(RequestKind::Plan(Box::new(params)))
            }
        }
    }
}

/// Outbound side of the bus, shared by the dispatcher and the RTL.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Boolean ack for the most recent planning request.
    async fn ack(&self, ok: bool);

    /// User-facing notification (RTL exhaustion and similar).
    async fn notify(&self, message: &str) -> Result<()>;
}

pub struct BusClient {
    client: AsyncClient,
    cfg: BusConfig,
}

impl BusClient {
    /// Connect, subscribe to the request topic, and return the outbound
    /// client plus a channel of parsed requests.
    pub fn connect(cfg: &BusConfig) -> (BusClient, mpsc::Receiver<PlanningRequest>) {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        let (client, mut event_loop) = AsyncClient::new(options, 16);

        let (tx, rx) = mpsc::channel(16);
        let subscribe_client = client.clone();
        let request_topic = cfg.request_topic.clone();
        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(topic = %request_topic, "bus connected, subscribing");
                        if let Err(e) = subscribe_client
                            .subscribe(request_topic.as_str(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!(error = %e, "bus subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish)))
                        if publish.topic == request_topic =>
                    {
                        match serde_json::from_slice::<PlanningRequest>(&publish.payload) {
                            Ok(request) => {
                                debug!(topic = %publish.topic, "planning request received");
                                if tx.send(request).await.is_err() {
                                    // Dispatcher is gone; stop the loop.
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "undecodable planning request dropped");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Transient: back off and let rumqttc reconnect.
                        warn!(error = %e, "bus connection error, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (BusClient { client, cfg: cfg.clone() }, rx)
    }
}

#[async_trait]
impl BusPublisher for BusClient {
    async fn ack(&self, ok: bool) {
        let payload = if ok { "true" } else { "false" };
        if let Err(e) = self
            .client
            .publish(self.cfg.ack_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!(error = %e, "failed to publish ack");
        }
    }

    async fn notify(&self, message: &str) -> Result<()> {
        let payload = serde_json::json!({ "message": message }).to_string();
        self.client
            .publish(self.cfg.notify_topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .context("notify publish failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_a_stop_request() {
        let request: PlanningRequest = serde_json::from_str("{}").unwrap();
        assert!(matches!(request.interpret().unwrap(), RequestKind::Stop));

        let request: PlanningRequest = serde_json::from_str(r#"{"params": {}}"#).unwrap();
        assert!(matches!(request.interpret().unwrap(), RequestKind::Stop));

        let request: PlanningRequest = serde_json::from_str(r#"{"params": null}"#).unwrap();
        assert!(matches!(request.interpret().unwrap(), RequestKind::Stop));
    }

    #[test]
    fn full_request_parses_profiles_and_flags() {
        let raw = r#"{
            "params": {
                "start": "2025-01-15T06:00:00Z",
                "stop": "2025-01-15T06:10:00Z",
                "interval": 600,
                "price_profile": {"2025-01-15T06:00:00Z": 0.1},
                "power_limit": {"2025-01-15T06:00:00Z": 10.0},
                "space_heating": true,
                "electric_storage": true,
                "electric_vehicle": true,
                "water_heater": true
            }
        }"#;
        let request: PlanningRequest = serde_json::from_str(raw).unwrap();
        match request.interpret().unwrap() {
            RequestKind::Plan(params) => {
                assert_eq!(params.interval, 600);
                assert!(params.space_heating && params.water_heater);
                assert_eq!(params.price_profile.len(), 1);
                assert_eq!(params.power_limit.len(), 1);
            }
            RequestKind::Stop => panic!("expected a planning request"),
        }
    }

    #[test]
    fn malformed_params_are_an_error() {
        let request: PlanningRequest =
            serde_json::from_str(r#"{"params": {"start": "not-a-date"}}"#).unwrap();
        assert!(request.interpret().is_err());
    }
}
