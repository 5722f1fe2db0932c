//! Model Predictive Planner.
//!
//! One cycle: validate the horizon, pull the required forecasts, compose
//! the enabled device sub-models into a single convex (possibly
//! mixed-integer) program, solve it off the async runtime, and interpret
//! the primal values into a dispatch schedule that is POSTed to the Core
//! API and mirrored into the TSDB.

mod inputs;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::Duration;
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::PlanningParams;
use crate::config::Config;
use crate::coreapi::CoreApi;
use crate::domain::{ControlError, Device, DeviceKind, DispatchSchedule, Horizon};
use crate::models::{self, BuiltSubModel, SubModel};
use crate::solver::{LinExpr, ProblemBuilder, SolveOptions, SolveStatus};
use crate::tsdb::ResultSink;

pub struct Planner {
    core: Arc<dyn CoreApi>,
    sink: Arc<dyn ResultSink>,
    cfg: Config,
}

impl Planner {
    pub fn new(core: Arc<dyn CoreApi>, sink: Arc<dyn ResultSink>, cfg: Config) -> Self {
        Self { core, sink, cfg }
    }

    /// Run one full planning cycle. On failure the previously posted
    /// schedule stays in place; the caller turns the error into a negative
    /// ack. `Ok(None)` means the cycle was superseded at its one
    /// cancellation point (between solve and interpret) and nothing was
    /// written.
    pub async fn run_cycle(
        &self,
        params: &PlanningParams,
        cancel: &CancellationToken,
    ) -> Result<Option<DispatchSchedule>, ControlError> {
        let horizon =
            Horizon::new(params.start, params.stop, Duration::seconds(params.interval))?;
        let n = horizon.steps();

        let prices = params.price_profile.sample_on(&horizon)?;
        let limits = params.power_limit.sample_on(&horizon)?;

        let non_controllable = self
            .core
            .non_controllable_forecast("power", horizon.start(), horizon.stop())
            .await
            .map_err(|e| {
                ControlError::DataUnavailable(format!("non-controllable forecast: {e:#}"))
            })?
            .sample_on(&horizon)?;

        let devices = self.enabled_devices(params).await?;
        let digest = input_digest(params, &non_controllable, &devices);

        // Assemble sub-models through the kind registry.
        let mut submodels: Vec<Box<dyn SubModel>> = Vec::with_capacity(devices.len());
        for device in &devices {
            let inputs = inputs::assemble(self.core.as_ref(), &self.cfg, device, &horizon).await?;
            submodels.push(models::submodel_for(device, inputs)?);
        }

        if submodels.is_empty() {
            // Nothing controllable: the plan is exactly the uncontrollable
            // load, which just has to fit under the limit.
            for k in 0..n {
                if non_controllable[k] > limits[k] {
                    warn!(digest = %digest, step = k, "uncontrollable load alone exceeds the limit");
                    return Err(ControlError::SolverInfeasible);
                }
            }
            let schedule = DispatchSchedule::new(&horizon, self.cfg.mpc.priority, Vec::new());
            self.publish(&schedule).await?;
            info!(digest = %digest, "trivial cycle: no controllable devices enabled");
            return Ok(Some(schedule));
        }

        // Compose the global problem.
        let mut pb = ProblemBuilder::new();
        let mut built: Vec<Box<dyn BuiltSubModel>> = Vec::with_capacity(submodels.len());
        for model in &submodels {
            built.push(model.build(&mut pb, &horizon)?);
        }

        let dt_h = horizon.dt_hours();
        for k in 0..n {
            let mut net_kw = LinExpr::constant(non_controllable[k]);
            for model in &built {
                net_kw = net_kw.plus(model.dispatch_kw()[k].clone());
            }
            // Grid limit at every step.
            pb.le(net_kw.clone(), limits[k]);
            // Energy cost of the net draw.
            pb.linear_cost(&net_kw, prices[k] * dt_h);
        }

        let options = SolveOptions { node_budget: self.cfg.mpc.node_budget };
        let solution = tokio::task::spawn_blocking(move || pb.solve(&options))
            .await
            .map_err(|e| ControlError::SolverError(format!("solver task: {e}")))?;

        info!(
            digest = %digest,
            status = %solution.status,
            solve_ms = solution.solve_time.as_millis() as u64,
            iterations = solution.iterations,
            nodes = solution.nodes_explored,
            "planning solve finished"
        );

        match solution.status {
            SolveStatus::Optimal | SolveStatus::OptimalInaccurate => {}
            SolveStatus::Infeasible => {
                warn!(digest = %digest, "planning problem infeasible, keeping previous schedule");
                return Err(ControlError::SolverInfeasible);
            }
            SolveStatus::Unbounded => {
                warn!(digest = %digest, "planning problem unbounded, keeping previous schedule");
                return Err(ControlError::SolverError("UNBOUNDED".into()));
            }
            SolveStatus::Error(reason) => {
                warn!(digest = %digest, %reason, "solver failed, keeping previous schedule");
                return Err(ControlError::SolverError(reason));
            }
        }

        // The solver itself is atomic; this is the one cancellation point.
        if cancel.is_cancelled() {
            info!(digest = %digest, "cycle superseded after solve, discarding result");
            return Ok(None);
        }

        let series = built
            .iter()
            .flat_map(|model| model.interpret(&solution, &horizon))
            .collect_vec();
        let schedule = DispatchSchedule::new(&horizon, self.cfg.mpc.priority, series);
        schedule
            .validate()
            .map_err(|e| ControlError::SolverError(format!("schedule validation: {e}")))?;

        self.publish(&schedule).await?;
        Ok(Some(schedule))
    }

    /// Inventory filtered by the request's enable flags, in deterministic
    /// order.
    async fn enabled_devices(
        &self,
        params: &PlanningParams,
    ) -> Result<Vec<Device>, ControlError> {
        let devices = self
            .core
            .devices()
            .await
            .map_err(|e| ControlError::DataUnavailable(format!("device inventory: {e:#}")))?;
        Ok(devices
            .into_iter()
            .filter(|device| match device.kind() {
                DeviceKind::SpaceHeating => params.space_heating,
                DeviceKind::WaterHeater => params.water_heater,
                DeviceKind::ElectricStorage => params.electric_storage,
                DeviceKind::ElectricVehicleV1g => params.electric_vehicle,
            })
            .sorted_by(|a, b| a.entity_id.cmp(&b.entity_id))
            .collect())
    }

    async fn publish(&self, schedule: &DispatchSchedule) -> Result<(), ControlError> {
        self.core
            .post_schedule(schedule)
            .await
            .map_err(|e| ControlError::WriteFailed(format!("schedule post: {e:#}")))?;
        if let Err(e) = self.sink.write_schedule(schedule).await {
            // The TSDB mirror is best-effort.
            warn!(error = %e, "failed to mirror schedule into the TSDB");
        }
        Ok(())
    }
}

/// Cheap digest of the cycle inputs, for correlating failure logs.
fn input_digest(params: &PlanningParams, non_controllable: &[f64], devices: &[Device]) -> String {
    let mut hasher = DefaultHasher::new();
    params.start.timestamp().hash(&mut hasher);
    params.stop.timestamp().hash(&mut hasher);
    params.interval.hash(&mut hasher);
    for (at, value) in params.price_profile.iter() {
        at.timestamp().hash(&mut hasher);
        value.to_bits().hash(&mut hasher);
    }
    for (at, value) in params.power_limit.iter() {
        at.timestamp().hash(&mut hasher);
        value.to_bits().hash(&mut hasher);
    }
    for value in non_controllable {
        value.to_bits().hash(&mut hasher);
    }
    for device in devices {
        device.entity_id.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}
