//! Request dispatcher.
//!
//! Owns the lifecycle of the one planner job and the one RTL task. A bus
//! message either stops the RTL (empty params) or replaces both: the old
//! planner job is cancelled, the old RTL is drained to `Stopped`, and new
//! instances are started against the request's limit profile.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{BusPublisher, PlanningParams, PlanningRequest, RequestKind};
use crate::config::Config;
use crate::coreapi::CoreApi;
use crate::domain::{Device, DeviceKind, Horizon};
use crate::planner::Planner;
use crate::rtl::{self, RtlHandle};

struct PlannerJob {
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

pub struct Dispatcher {
    core: Arc<dyn CoreApi>,
    bus: Arc<dyn BusPublisher>,
    planner: Arc<Planner>,
    cfg: Config,
    rtl: Option<RtlHandle>,
    job: Option<PlannerJob>,
}

impl Dispatcher {
    pub fn new(
        core: Arc<dyn CoreApi>,
        bus: Arc<dyn BusPublisher>,
        planner: Arc<Planner>,
        cfg: Config,
    ) -> Self {
        Self { core, bus, planner, cfg, rtl: None, job: None }
    }

    /// Handle one bus request to completion of its *dispatch* (the planner
    /// job itself runs detached and acks when it finishes).
    pub async fn handle(&mut self, request: PlanningRequest) {
        match request.interpret() {
            Ok(RequestKind::Stop) => {
                info!("stop request received");
                self.stop_rtl().await;
                self.bus.ack(true).await;
            }
            Ok(RequestKind::Plan(params)) => self.start_cycle(*params).await,
            Err(e) => {
                warn!(error = %e, "rejecting malformed planning request");
                self.bus.ack(false).await;
            }
        }
    }

    async fn start_cycle(&mut self, params: PlanningParams) {
        // Horizon problems are rejected immediately, before any state
        // mutation.
        if let Err(e) = Horizon::new(
            params.start,
            params.stop,
            chrono::Duration::seconds(params.interval),
        ) {
            warn!(error = %e, code = e.code(), "invalid horizon");
            self.bus.ack(false).await;
            return;
        }

        // Replace the outstanding planner job. Cancellation is best-effort:
        // the job only checks the token between solve and interpret, so the
        // old join handle is left to run out on its own.
        if let Some(job) = self.job.take() {
            job.cancel.cancel();
        }

        // Restart the RTL under the new limit profile. A start failure is
        // reported but must not block the planning cycle.
        self.stop_rtl().await;
        match self.rtl_devices(&params).await {
            Ok(devices) if !devices.is_empty() => {
                let handle = rtl::spawn(
                    Arc::clone(&self.core),
                    Arc::clone(&self.bus),
                    devices,
                    params.power_limit.clone(),
                    self.cfg.rtl.clone(),
                );
                self.rtl = Some(handle);
            }
            Ok(_) => {
                info!("no enabled devices, RTL not started");
            }
            Err(e) => {
                error!(error = %e, "RTL start failed; continuing with planner only");
            }
        }

        // Schedule the planner job at `start` (immediately if already past).
        let cancel = CancellationToken::new();
        let job_cancel = cancel.clone();
        let planner = Arc::clone(&self.planner);
        let bus = Arc::clone(&self.bus);
        let join = tokio::spawn(async move {
            let delay = (params.start - Utc::now()).to_std().unwrap_or_default();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = job_cancel.cancelled() => {
                        info!("planner job superseded before start");
                        return;
                    }
                }
            }

            match planner.run_cycle(&params, &job_cancel).await {
                Ok(Some(schedule)) => {
                    info!(
                        devices = schedule.series.len(),
                        priority = schedule.priority,
                        "planning cycle complete"
                    );
                    bus.ack(true).await;
                }
                Ok(None) => {
                    // Superseded mid-flight: the new job owns the ack.
                }
                Err(e) => {
                    error!(code = e.code(), error = %e, "planning cycle failed");
                    if !job_cancel.is_cancelled() {
                        bus.ack(false).await;
                    }
                }
            }
        });
        self.job = Some(PlannerJob { cancel, join });
    }

    /// Devices the RTL may curtail under this request's enable flags.
    async fn rtl_devices(&self, params: &PlanningParams) -> anyhow::Result<Vec<Device>> {
        let devices = self.core.devices().await?;
        Ok(devices
            .into_iter()
            .filter(|device| match device.kind() {
                DeviceKind::SpaceHeating => params.space_heating,
                DeviceKind::WaterHeater => params.water_heater,
                DeviceKind::ElectricStorage => params.electric_storage,
                DeviceKind::ElectricVehicleV1g => params.electric_vehicle,
            })
            .collect())
    }

    async fn stop_rtl(&mut self) {
        if let Some(handle) = self.rtl.take() {
            handle.stop().await;
        }
    }

    /// Graceful shutdown: cancel the planner job, drain the RTL.
    pub async fn shutdown(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel.cancel();
            let _ = job.join.await;
        }
        self.stop_rtl().await;
    }
}
