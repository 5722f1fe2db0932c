//! Water heater tank model.
//!
//! Single well-mixed tank: element power heats the volume, hot-water draw
//! replaces tank water with inlet-temperature water, and the envelope leaks
//! towards ambient. Works in watts internally; the dispatch expression is
//! converted to kW like every other sub-model.

use crate::domain::{
    ControlError, ControlSeries, ControlSignal, Device, Horizon, WaterHeaterParams,
};
use crate::domain::series::from_steps;
use crate::solver::{LinExpr, ProblemBuilder, Solution, Var};

use super::{check_step_len, priority_weight, BuiltSubModel, SubModel};

/// Volumetric heat capacity of water, Wh/(L·K).
const WATER_HEAT_CAPACITY_WH_PER_L_K: f64 = 1.16;

pub struct WaterHeaterInputs {
    /// Tank temperature at horizon start, °C.
    pub t_initial_c: f64,
    /// Forecast hot-water draw per step, L/h.
    pub draw_l_per_h: Vec<f64>,
    /// Ambient temperature around the tank per step, °C.
    pub ambient_c: Vec<f64>,
    /// Desired tank temperature per step, °C.
    pub desired_c: Vec<f64>,
}

pub struct WaterHeaterModel {
    device: Device,
    params: WaterHeaterParams,
    inputs: WaterHeaterInputs,
}

impl WaterHeaterModel {
    pub fn new(device: Device, params: WaterHeaterParams, inputs: WaterHeaterInputs) -> Self {
        Self { device, params, inputs }
    }
}

struct BuiltWaterHeater {
    entity_id: String,
    power_w: Vec<Var>,
    temperature: Vec<Var>,
    dispatch: Vec<LinExpr>,
}

impl SubModel for WaterHeaterModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn build(
        &self,
        pb: &mut ProblemBuilder,
        horizon: &Horizon,
    ) -> Result<Box<dyn BuiltSubModel>, ControlError> {
        let n = horizon.steps();
        check_step_len("water heater draw forecast", &self.inputs.draw_l_per_h, horizon)?;
        check_step_len("water heater ambient", &self.inputs.ambient_c, horizon)?;
        check_step_len("water heater setpoints", &self.inputs.desired_c, horizon)?;

        let params = &self.params;
        if params.volume_l <= 0.0 {
            return Err(ControlError::ConfigInvalid(format!(
                "water heater {} has non-positive volume",
                self.device.entity_id
            )));
        }

        let p_max_w = params.power_max_kw * 1000.0;
        let power_w: Vec<Var> = (0..n).map(|_| pb.var(0.0, p_max_w)).collect();

        // T[0] is pinned to the measurement; bounds apply to planned steps.
        let mut temperature = Vec::with_capacity(n + 1);
        let t0 = pb.var(self.inputs.t_initial_c, self.inputs.t_initial_c);
        temperature.push(t0);
        for _ in 0..n {
            temperature.push(pb.var(params.t_min_c, params.t_max_c));
        }

        // Tank energy balance per step, divided through by C·V:
        //   T[k+1] = T[k] + a·(p[k] − C·draw[k]·(T[k] − T_inlet) − loss·(T[k] − T_amb[k]))
        // with a = Δt / (C·V).
        let c = WATER_HEAT_CAPACITY_WH_PER_L_K;
        let a = horizon.dt_hours() / (c * params.volume_l);
        for k in 0..n {
            let draw_w_per_k = c * self.inputs.draw_l_per_h[k];
            let decay = 1.0 - a * (draw_w_per_k + params.standing_loss_w_per_k);
            let rhs = a
                * (draw_w_per_k * params.t_inlet_c
                    + params.standing_loss_w_per_k * self.inputs.ambient_c[k]);

            let mut balance = LinExpr::from(temperature[k + 1]);
            balance.add_term(temperature[k], -decay);
            balance.add_term(power_w[k], -a);
            pb.eq(balance, rhs);
        }

        // Comfort: quadratic pull towards the desired temperature.
        let weight = priority_weight(&self.device);
        for k in 0..n {
            let deviation = LinExpr::constant(self.inputs.desired_c[k])
                .minus(LinExpr::from(temperature[k + 1]))
                .scaled(1.0 / params.comfort_band_c);
            pb.quadratic_cost(&deviation, weight);
        }

        let dispatch: Vec<LinExpr> =
            power_w.iter().map(|&p| LinExpr::term(p, 1e-3)).collect();

        Ok(Box::new(BuiltWaterHeater {
            entity_id: self.device.entity_id.clone(),
            power_w,
            temperature,
            dispatch,
        }))
    }
}

impl BuiltSubModel for BuiltWaterHeater {
    fn dispatch_kw(&self) -> &[LinExpr] {
        &self.dispatch
    }

    fn interpret(&self, solution: &Solution, horizon: &Horizon) -> Vec<ControlSeries> {
        let power: Vec<f64> = self.power_w.iter().map(|&v| solution.value(v)).collect();
        // Tank temperature over each step (state at step start).
        let temps: Vec<f64> = self.temperature[..horizon.steps()]
            .iter()
            .map(|&v| solution.value(v))
            .collect();

        vec![ControlSeries {
            entity_id: self.entity_id.clone(),
            kind: crate::domain::DeviceKind::WaterHeater,
            signal: ControlSignal::PowerW,
            control: from_steps(horizon, &power),
            temperature_c: Some(from_steps(horizon, &temps)),
            soc_wh: None,
        }]
    }
}
