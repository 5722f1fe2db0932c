//! Unidirectional (V1G) EV charger model.
//!
//! The charger is a gate: at each step it either charges at full power or
//! not at all, and only while the vehicle is plugged in. This is the only
//! sub-model that introduces binary variables into the planning problem.

use crate::domain::series::from_steps;
use crate::domain::{ControlError, ControlSeries, ControlSignal, Device, EvParams, Horizon};
use crate::solver::{LinExpr, ProblemBuilder, Solution, Var};

use super::{priority_weight, BuiltSubModel, SubModel};

pub struct EvInputs {
    /// Vehicle residual energy at horizon start, Wh.
    pub e_initial_wh: f64,
    /// Connection profile per step: true while the vehicle is plugged in.
    pub connected: Vec<bool>,
    /// Desired residual energy per step, Wh.
    pub e_desired_wh: Vec<f64>,
    /// Optional departure SoC floor, Wh; overrides the device parameter.
    pub e_final_wh: Option<f64>,
}

pub struct EvModel {
    device: Device,
    params: EvParams,
    inputs: EvInputs,
}

impl EvModel {
    pub fn new(device: Device, params: EvParams, inputs: EvInputs) -> Self {
        Self { device, params, inputs }
    }
}

struct BuiltEv {
    entity_id: String,
    p_max_kw: f64,
    gate: Vec<Var>,
    connected: Vec<bool>,
    energy_wh: Vec<Var>,
    dispatch: Vec<LinExpr>,
}

impl SubModel for EvModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn build(
        &self,
        pb: &mut ProblemBuilder,
        horizon: &Horizon,
    ) -> Result<Box<dyn BuiltSubModel>, ControlError> {
        let n = horizon.steps();
        if self.inputs.connected.len() != n {
            return Err(ControlError::DataUnavailable(format!(
                "EV connection profile: expected {n} samples, got {}",
                self.inputs.connected.len()
            )));
        }
        super::check_step_len("EV desired energy", &self.inputs.e_desired_wh, horizon)?;

        let params = &self.params;
        if params.capacity_wh <= 0.0 || params.p_max_kw <= 0.0 {
            return Err(ControlError::ConfigInvalid(format!(
                "EV {} has non-positive capacity or charge power",
                self.device.entity_id
            )));
        }

        // Gate u[k] ∈ {0,1}; pinned shut while disconnected so the branching
        // layer never touches those steps.
        let gate: Vec<Var> = (0..n)
            .map(|k| {
                let u = pb.binary();
                if !self.inputs.connected[k] {
                    pb.fix(u, 0.0);
                }
                u
            })
            .collect();

        let mut energy_wh = Vec::with_capacity(n + 1);
        energy_wh.push(pb.var(self.inputs.e_initial_wh, self.inputs.e_initial_wh));
        for _ in 0..n {
            energy_wh.push(pb.var(params.e_min_wh, params.e_max_wh));
        }

        // E[k+1] = γ·E[k] + η_c·u[k]·P_max·Δt.
        let wh_per_step = params.eta_charge * params.p_max_kw * 1000.0 * horizon.dt_hours();
        for k in 0..n {
            let mut balance = LinExpr::from(energy_wh[k + 1]);
            balance.add_term(energy_wh[k], -params.retention);
            balance.add_term(gate[k], -wh_per_step);
            pb.eq(balance, 0.0);
        }

        if let Some(e_final) = self.inputs.e_final_wh.or(params.e_final_wh) {
            pb.ge(LinExpr::from(energy_wh[n]), e_final);
        }

        let weight = priority_weight(&self.device);
        for k in 0..n {
            let deviation = LinExpr::constant(self.inputs.e_desired_wh[k])
                .minus(LinExpr::from(energy_wh[k + 1]))
                .scaled(1.0 / params.capacity_wh);
            pb.quadratic_cost(&deviation, weight);
        }

        let dispatch: Vec<LinExpr> = gate
            .iter()
            .zip(&self.inputs.connected)
            .map(|(&u, &connected)| {
                if connected {
                    LinExpr::term(u, params.p_max_kw)
                } else {
                    LinExpr::zero()
                }
            })
            .collect();

        Ok(Box::new(BuiltEv {
            entity_id: self.device.entity_id.clone(),
            p_max_kw: params.p_max_kw,
            gate,
            connected: self.inputs.connected.clone(),
            energy_wh,
            dispatch,
        }))
    }
}

impl BuiltSubModel for BuiltEv {
    fn dispatch_kw(&self) -> &[LinExpr] {
        &self.dispatch
    }

    fn interpret(&self, solution: &Solution, horizon: &Horizon) -> Vec<ControlSeries> {
        let n = horizon.steps();
        let power_w: Vec<f64> = (0..n)
            .map(|k| {
                if self.connected[k] {
                    solution.value(self.gate[k]).round() * self.p_max_kw * 1000.0
                } else {
                    0.0
                }
            })
            .collect();
        let soc: Vec<f64> = self.energy_wh[..n].iter().map(|&v| solution.value(v)).collect();

        vec![ControlSeries {
            entity_id: self.entity_id.clone(),
            kind: crate::domain::DeviceKind::ElectricVehicleV1g,
            signal: ControlSignal::PowerW,
            control: from_steps(horizon, &power_w),
            temperature_c: None,
            soc_wh: Some(from_steps(horizon, &soc)),
        }]
    }
}
