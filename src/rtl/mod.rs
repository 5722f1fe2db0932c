//! Real-Time Limiter.
//!
//! A single long-running task at ~1 Hz. Each tick it samples the building's
//! total draw, looks up the current grid limit, and if the limit (minus a
//! safety margin) is threatened, curtails the lowest-priority device that
//! is still available — outside its anti-rebound window and not already at
//! its critical action. When nothing is left to shed it emits a user
//! notification and keeps watching.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::BusPublisher;
use crate::config::RtlConfig;
use crate::coreapi::CoreApi;
use crate::domain::{CriticalAction, Device, DeviceKind, TimeSeries};

/// Lifecycle phases, driven exclusively by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtlPhase {
    Stopped,
    Running,
    Stopping,
}

/// The slice of a device the limiter needs.
#[derive(Debug, Clone)]
struct RtlDevice {
    entity_id: String,
    kind: DeviceKind,
    priority: i64,
    critical_action: CriticalAction,
}

impl From<&Device> for RtlDevice {
    fn from(device: &Device) -> Self {
        Self {
            entity_id: device.entity_id.clone(),
            kind: device.kind(),
            priority: device.priority,
            critical_action: device.critical_action,
        }
    }
}

/// Handle owned by the dispatcher. Dropping it does not stop the task;
/// call [`RtlHandle::stop`] to drain it to `Stopped`.
pub struct RtlHandle {
    cancel: CancellationToken,
    phase_rx: watch::Receiver<RtlPhase>,
    join: tokio::task::JoinHandle<()>,
}

impl RtlHandle {
    pub fn phase(&self) -> RtlPhase {
        *self.phase_rx.borrow()
    }

    /// Signal cancellation and wait for the task to exit its current tick.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "RTL task ended abnormally");
        }
    }
}

/// Start the limiter over the given devices and limit profile.
pub fn spawn(
    core: Arc<dyn CoreApi>,
    notifier: Arc<dyn BusPublisher>,
    devices: Vec<Device>,
    limit_profile: TimeSeries,
    cfg: RtlConfig,
) -> RtlHandle {
    let cancel = CancellationToken::new();
    let (phase_tx, phase_rx) = watch::channel(RtlPhase::Running);

    let task_cancel = cancel.clone();
    let rtl_devices: Vec<RtlDevice> = devices.iter().map(RtlDevice::from).collect();
    let join = tokio::spawn(async move {
        run(core, notifier, rtl_devices, limit_profile, cfg, task_cancel, phase_tx).await;
    });

    RtlHandle { cancel, phase_rx, join }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    core: Arc<dyn CoreApi>,
    notifier: Arc<dyn BusPublisher>,
    mut devices: Vec<RtlDevice>,
    limit_profile: TimeSeries,
    cfg: RtlConfig,
    cancel: CancellationToken,
    phase_tx: watch::Sender<RtlPhase>,
) {
    // Curtailment order: lowest priority first, stable on entity id.
    devices.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.entity_id.cmp(&b.entity_id)));

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.tick_period_s.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_adjustment: HashMap<String, Instant> = HashMap::new();
    let mut curtailed: HashSet<String> = HashSet::new();

    info!(devices = devices.len(), "RTL running");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let total_kw = match core.building_consumption_kw().await {
            Ok(value) => value,
            Err(e) => {
                // Never curtail blind.
                debug!(error = %e, "consumption sample failed, skipping tick");
                continue;
            }
        };

        let now = Utc::now();
        let Some(limit_kw) = limit_profile.value_at(now) else {
            debug!("no limit value at or before now, skipping tick");
            continue;
        };

        if total_kw <= limit_kw - cfg.safety_margin_kw {
            continue;
        }

        let tick_instant = Instant::now();
        let next = devices.iter().find(|device| {
            if curtailed.contains(&device.entity_id) {
                return false;
            }
            match last_adjustment.get(&device.entity_id) {
                Some(&at) => {
                    tick_instant.duration_since(at) >= antirebound_window(&cfg, device.kind)
                }
                None => true,
            }
        });

        let Some(device) = next else {
            warn!(total_kw, limit_kw, "limit exceeded with no curtailable device left");
            if let Err(e) = notifier
                .notify(&format!(
                    "building draw {total_kw:.1} kW exceeds limit {limit_kw:.1} kW and all \
                     devices are already curtailed"
                ))
                .await
            {
                warn!(error = %e, "failed to emit exhaustion notification");
            }
            continue;
        };

        let setpoint = device.critical_action.setpoint_value();
        last_adjustment.insert(device.entity_id.clone(), tick_instant);
        match core.set_setpoint(&device.entity_id, setpoint).await {
            Ok(()) => {
                info!(
                    entity_id = %device.entity_id,
                    priority = device.priority,
                    setpoint,
                    total_kw,
                    limit_kw,
                    "curtailed device"
                );
                curtailed.insert(device.entity_id.clone());
            }
            Err(e) => {
                // Leave it un-curtailed; the anti-rebound stamp makes the
                // next tick move on to the next candidate.
                warn!(error = %e, entity_id = %device.entity_id, "setpoint write failed");
            }
        }
    }

    let _ = phase_tx.send(RtlPhase::Stopping);
    // Devices stay in their last commanded state; the next planning cycle
    // overwrites them.
    let _ = phase_tx.send(RtlPhase::Stopped);
    info!("RTL stopped");
}

fn antirebound_window(cfg: &RtlConfig, kind: DeviceKind) -> Duration {
    match kind {
        DeviceKind::ElectricStorage => Duration::from_secs(cfg.antirebound_battery_s),
        _ => Duration::from_secs(cfg.antirebound_default_s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceSpec, DispatchSchedule, StorageParams, WaterHeaterParams};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    /// Core API fake: scripted consumption, recorded setpoint writes.
    struct FakeCore {
        consumption_kw: Mutex<f64>,
        setpoints: Mutex<Vec<(String, f64)>>,
        fail_consumption: Mutex<bool>,
        fail_setpoints_for: Mutex<HashSet<String>>,
    }

    impl FakeCore {
        fn new(consumption_kw: f64) -> Self {
            Self {
                consumption_kw: Mutex::new(consumption_kw),
                setpoints: Mutex::new(Vec::new()),
                fail_consumption: Mutex::new(false),
                fail_setpoints_for: Mutex::new(HashSet::new()),
            }
        }

        fn writes(&self) -> Vec<(String, f64)> {
            self.setpoints.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CoreApi for FakeCore {
        async fn devices(&self) -> Result<Vec<Device>> {
            Ok(Vec::new())
        }
        async fn device_state(&self, _: &str, _: &str) -> Result<f64> {
            anyhow::bail!("not scripted")
        }
        async fn device_state_vector(&self, _: &str, _: &str) -> Result<Vec<f64>> {
            anyhow::bail!("not scripted")
        }
        async fn building_consumption_kw(&self) -> Result<f64> {
            if *self.fail_consumption.lock().unwrap() {
                anyhow::bail!("sensor offline");
            }
            Ok(*self.consumption_kw.lock().unwrap())
        }
        async fn preference(
            &self,
            _: &str,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<TimeSeries> {
            anyhow::bail!("not scripted")
        }
        async fn preference_channels(
            &self,
            _: &str,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<Vec<TimeSeries>> {
            anyhow::bail!("not scripted")
        }
        async fn historic_channels(
            &self,
            _: &str,
            _: Option<&str>,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<Vec<TimeSeries>> {
            anyhow::bail!("not scripted")
        }
        async fn weather_historic(
            &self,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<TimeSeries> {
            anyhow::bail!("not scripted")
        }
        async fn weather_forecast(
            &self,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<TimeSeries> {
            anyhow::bail!("not scripted")
        }
        async fn non_controllable_forecast(
            &self,
            _: &str,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
        ) -> Result<TimeSeries> {
            anyhow::bail!("not scripted")
        }
        async fn set_setpoint(&self, entity_id: &str, setpoint: f64) -> Result<()> {
            self.setpoints.lock().unwrap().push((entity_id.to_string(), setpoint));
            if self.fail_setpoints_for.lock().unwrap().contains(entity_id) {
                anyhow::bail!("device rejected setpoint");
            }
            Ok(())
        }
        async fn post_schedule(&self, _: &DispatchSchedule) -> Result<()> {
            Ok(())
        }
    }

    struct FakeBus {
        notifications: Mutex<Vec<String>>,
    }

    impl FakeBus {
        fn new() -> Self {
            Self { notifications: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl BusPublisher for FakeBus {
        async fn ack(&self, _ok: bool) {}
        async fn notify(&self, message: &str) -> Result<()> {
            self.notifications.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn water_heater(priority: i64) -> Device {
        Device {
            entity_id: format!("wh-p{priority}"),
            priority,
            critical_action: CriticalAction::PowerOff,
            spec: DeviceSpec::WaterHeater(WaterHeaterParams {
                volume_l: 270.0,
                power_max_kw: 4.0,
                t_min_c: 45.0,
                t_max_c: 65.0,
                t_inlet_c: 12.0,
                standing_loss_w_per_k: 2.0,
                comfort_band_c: 2.0,
            }),
        }
    }

    fn space_heater(priority: i64) -> Device {
        Device {
            entity_id: format!("sh-p{priority}"),
            priority,
            critical_action: CriticalAction::MinimumSetpoint { setpoint_c: 15.0 },
            spec: DeviceSpec::SpaceHeating(crate::domain::SpaceHeatingParams {
                zones: 1,
                heaters: 1,
                max_total_power_kw: 8.0,
                ramp_kw_per_step: 2.0,
                t_min_c: 15.0,
                t_max_c: 25.0,
                comfort_band_c: 0.5,
                weather_channels: 1,
            }),
        }
    }

    fn battery(priority: i64) -> Device {
        Device {
            entity_id: format!("bat-p{priority}"),
            priority,
            critical_action: CriticalAction::PowerOff,
            spec: DeviceSpec::ElectricStorage(StorageParams {
                capacity_wh: 10_000.0,
                e_min_wh: 1_000.0,
                e_max_wh: 9_500.0,
                p_charge_max_kw: 5.0,
                p_discharge_max_kw: 5.0,
                eta_charge: 0.95,
                eta_discharge: 0.95,
                retention: 1.0,
                e_final_wh: None,
            }),
        }
    }

    fn limit_profile(limit_kw: f64) -> TimeSeries {
        [(Utc::now() - ChronoDuration::hours(1), limit_kw)].into_iter().collect()
    }

    fn config() -> RtlConfig {
        RtlConfig {
            tick_period_s: 1,
            safety_margin_kw: 0.5,
            antirebound_default_s: 5,
            antirebound_battery_s: 30,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn curtails_lowest_priority_first() {
        let core = Arc::new(FakeCore::new(8.0));
        let bus = Arc::new(FakeBus::new());
        let handle = spawn(
            core.clone(),
            bus,
            vec![space_heater(5), water_heater(1)],
            limit_profile(5.0),
            config(),
        );

        // The first tick fires immediately; stop before the second one.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let writes = core.writes();
        assert_eq!(writes.len(), 1, "exactly one device per tick: {writes:?}");
        assert_eq!(writes[0].0, "wh-p1");
        assert_eq!(writes[0].1, 0.0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn antirebound_blocks_reuse_and_picks_next() {
        let core = Arc::new(FakeCore::new(8.0));
        let bus = Arc::new(FakeBus::new());
        let handle = spawn(
            core.clone(),
            bus.clone(),
            vec![space_heater(5), water_heater(1)],
            limit_profile(5.0),
            config(),
        );

        // Tick 1 (t=0) curtails the water heater; consumption stays high, so
        // tick 2 (1 s later, inside the 5 s window) must move to space
        // heating instead of re-adjusting the water heater.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let writes = core.writes();
        assert_eq!(writes.len(), 2, "{writes:?}");
        assert_eq!(writes[0].0, "wh-p1");
        assert_eq!(writes[1].0, "sh-p5");
        assert_eq!(writes[1].1, 15.0);

        // Both curtailed: the next exceeded tick notifies instead of
        // re-adjusting either device.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(core.writes().len(), 2);
        assert!(!bus.notifications.lock().unwrap().is_empty());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn batteries_use_the_longer_antirebound_window() {
        let core = Arc::new(FakeCore::new(9.0));
        core.fail_setpoints_for.lock().unwrap().insert("bat-p1".to_string());
        let bus = Arc::new(FakeBus::new());
        let handle = spawn(
            core.clone(),
            bus,
            vec![battery(1), water_heater(2)],
            limit_profile(5.0),
            config(),
        );

        // t=0: battery attempt fails (write rejected), stamping its 30 s
        // window. t=1: heater curtailed. The battery must not be retried
        // until the window lapses at t=30.
        tokio::time::sleep(Duration::from_millis(29_500)).await;
        let battery_attempts =
            core.writes().iter().filter(|(id, _)| id == "bat-p1").count();
        assert_eq!(battery_attempts, 1, "battery retried inside its window");

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let battery_attempts =
            core.writes().iter().filter(|(id, _)| id == "bat-p1").count();
        assert_eq!(battery_attempts, 2, "battery not retried after the window");

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn under_limit_means_no_action() {
        let core = Arc::new(FakeCore::new(4.0));
        let bus = Arc::new(FakeBus::new());
        let handle =
            spawn(core.clone(), bus, vec![water_heater(1)], limit_profile(5.0), config());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(core.writes().is_empty());
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sample_skips_the_tick() {
        let core = Arc::new(FakeCore::new(9.0));
        *core.fail_consumption.lock().unwrap() = true;
        let bus = Arc::new(FakeBus::new());
        let handle =
            spawn(core.clone(), bus, vec![water_heater(1)], limit_profile(5.0), config());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(core.writes().is_empty(), "must never curtail blind");
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_to_stopped() {
        let core = Arc::new(FakeCore::new(1.0));
        let bus = Arc::new(FakeBus::new());
        let handle =
            spawn(core.clone(), bus, vec![water_heater(1)], limit_profile(5.0), config());
        assert_eq!(handle.phase(), RtlPhase::Running);
        handle.stop().await;
    }
}
