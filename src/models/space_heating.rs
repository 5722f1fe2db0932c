//! Space heating model over the learned zone thermal dynamics.
//!
//! Zone temperatures follow the identified state-space model
//! `T[k+1] = Ax·T[k] + Au·p[k+1] + Aw·w[k+1]`; heater powers are the
//! decision variables. Comfort combines a per-zone occupancy-weighted
//! quadratic term with an ∞-norm penalty on the worst deviation, kept
//! linear through an epigraph variable.

use crate::domain::series::from_steps;
use crate::domain::{
    ControlError, ControlSeries, ControlSignal, Device, Horizon, SpaceHeatingParams, ThermalModel,
};
use crate::solver::{LinExpr, ProblemBuilder, Solution, Var};

use super::{priority_weight, BuiltSubModel, SubModel};

/// Weight of the ∞-norm comfort penalty relative to the quadratic terms.
const MAX_DEVIATION_WEIGHT: f64 = 100.0;

pub struct SpaceHeatingInputs {
    /// Zone temperatures at horizon start, °C (one per zone).
    pub t_initial_c: Vec<f64>,
    /// Desired zone temperature, indexed `[zone][step]`.
    pub desired_c: Vec<Vec<f64>>,
    /// Occupancy factor in [0, 1], indexed `[zone][step]`.
    pub occupancy: Vec<Vec<f64>>,
    /// Disturbance channels (outdoor temperature first), indexed
    /// `[channel][step]`.
    pub disturbances: Vec<Vec<f64>>,
    /// The learned thermal model to plan against.
    pub thermal: ThermalModel,
}

pub struct SpaceHeatingModel {
    device: Device,
    params: SpaceHeatingParams,
    inputs: SpaceHeatingInputs,
}

impl SpaceHeatingModel {
    pub fn new(
        device: Device,
        params: SpaceHeatingParams,
        inputs: SpaceHeatingInputs,
    ) -> Result<Self, ControlError> {
        let thermal = &inputs.thermal;
        if thermal.zones() != params.zones
            || thermal.inputs() != params.heaters
            || thermal.disturbances() != inputs.disturbances.len()
        {
            return Err(ControlError::ModelLoadFailed(format!(
                "thermal model shape ({}z/{}u/{}d) does not match device {} ({}z/{}u/{}d)",
                thermal.zones(),
                thermal.inputs(),
                thermal.disturbances(),
                device.entity_id,
                params.zones,
                params.heaters,
                inputs.disturbances.len(),
            )));
        }
        if inputs.t_initial_c.len() != params.zones {
            return Err(ControlError::DataUnavailable(format!(
                "initial zone temperatures: expected {}, got {}",
                params.zones,
                inputs.t_initial_c.len()
            )));
        }
        Ok(Self { device, params, inputs })
    }
}

struct BuiltSpaceHeating {
    entity_id: String,
    zones: usize,
    heater_kw: Vec<Vec<Var>>,
    zone_temp: Vec<Vec<Var>>,
    dispatch: Vec<LinExpr>,
}

impl SubModel for SpaceHeatingModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn build(
        &self,
        pb: &mut ProblemBuilder,
        horizon: &Horizon,
    ) -> Result<Box<dyn BuiltSubModel>, ControlError> {
        let n = horizon.steps();
        let zones = self.params.zones;
        let heaters = self.params.heaters;
        let thermal = &self.inputs.thermal;

        for (z, desired) in self.inputs.desired_c.iter().enumerate() {
            super::check_step_len(&format!("zone {z} setpoints"), desired, horizon)?;
        }
        for (z, occupancy) in self.inputs.occupancy.iter().enumerate() {
            super::check_step_len(&format!("zone {z} occupancy"), occupancy, horizon)?;
        }
        for (d, channel) in self.inputs.disturbances.iter().enumerate() {
            super::check_step_len(&format!("disturbance channel {d}"), channel, horizon)?;
        }
        if self.inputs.desired_c.len() != zones || self.inputs.occupancy.len() != zones {
            return Err(ControlError::DataUnavailable(format!(
                "space heating preferences cover {} zones, device has {zones}",
                self.inputs.desired_c.len()
            )));
        }

        // heater_kw[u][k]: per-heater power, capped at the per-heater share
        // of the total electric capacity.
        let per_heater_cap = self.params.max_total_power_kw / heaters.max(1) as f64;
        let heater_kw: Vec<Vec<Var>> = (0..heaters)
            .map(|_| (0..n).map(|_| pb.var(0.0, per_heater_cap)).collect())
            .collect();

        // zone_temp[z][k] for k = 0..=N; k = 0 pinned to the measurement.
        let zone_temp: Vec<Vec<Var>> = (0..zones)
            .map(|z| {
                let mut temps = Vec::with_capacity(n + 1);
                let t0 = self.inputs.t_initial_c[z];
                temps.push(pb.var(t0, t0));
                for _ in 0..n {
                    temps.push(pb.var(self.params.t_min_c, self.params.t_max_c));
                }
                temps
            })
            .collect();

        // Dynamics: T[k+1] = Ax·T[k] + Au·p[k] + Aw·w[k], row per zone.
        for k in 0..n {
            for z in 0..zones {
                let mut balance = LinExpr::from(zone_temp[z][k + 1]);
                for z2 in 0..zones {
                    balance.add_term(zone_temp[z2][k], -thermal.ax[(z, z2)]);
                }
                for u in 0..heaters {
                    balance.add_term(heater_kw[u][k], -thermal.au[(z, u)]);
                }
                let mut rhs = 0.0;
                for d in 0..thermal.disturbances() {
                    rhs += thermal.aw[(z, d)] * self.inputs.disturbances[d][k];
                }
                pb.eq(balance, rhs);
            }
        }

        // Ramp limit between consecutive steps, per heater.
        let ramp = self.params.ramp_kw_per_step;
        for u in 0..heaters {
            for k in 1..n {
                let delta =
                    LinExpr::from(heater_kw[u][k]).minus(LinExpr::from(heater_kw[u][k - 1]));
                pb.le(delta.clone(), ramp);
                pb.ge(delta, -ramp);
            }
        }

        // Comfort: occupancy-weighted quadratic plus ∞-norm epigraph.
        let weight = priority_weight(&self.device);
        let band = self.params.comfort_band_c;
        let max_dev = pb.var(0.0, f64::INFINITY);
        for z in 0..zones {
            for k in 0..n {
                let occupancy = self.inputs.occupancy[z][k];
                let deviation = LinExpr::constant(self.inputs.desired_c[z][k])
                    .minus(LinExpr::from(zone_temp[z][k + 1]))
                    .scaled(1.0 / band);
                pb.quadratic_cost(&deviation, weight * occupancy);

                // max_dev ≥ ±(weight·occupancy·deviation)
                let scaled = deviation.scaled(weight * occupancy);
                pb.le(scaled.clone().minus(LinExpr::from(max_dev)), 0.0);
                pb.le(scaled.scaled(-1.0).minus(LinExpr::from(max_dev)), 0.0);
            }
        }
        pb.linear_cost(&LinExpr::from(max_dev), MAX_DEVIATION_WEIGHT);

        let dispatch: Vec<LinExpr> = (0..n)
            .map(|k| {
                let mut total = LinExpr::zero();
                for u in 0..heaters {
                    total.add_term(heater_kw[u][k], 1.0);
                }
                total
            })
            .collect();

        Ok(Box::new(BuiltSpaceHeating {
            entity_id: self.device.entity_id.clone(),
            zones,
            heater_kw,
            zone_temp,
            dispatch,
        }))
    }
}

impl BuiltSubModel for BuiltSpaceHeating {
    fn dispatch_kw(&self) -> &[LinExpr] {
        &self.dispatch
    }

    fn interpret(&self, solution: &Solution, horizon: &Horizon) -> Vec<ControlSeries> {
        let n = horizon.steps();
        // The planned zone temperature trajectory doubles as the thermostat
        // setpoint command. That conflation is intentional and flagged for
        // downstream review in DESIGN.md.
        (0..self.zones)
            .map(|z| {
                let setpoints: Vec<f64> = (0..n)
                    .map(|k| solution.value(self.zone_temp[z][k + 1]))
                    .collect();
                let entity_id = if self.zones == 1 {
                    self.entity_id.clone()
                } else {
                    format!("{}:z{z}", self.entity_id)
                };
                ControlSeries {
                    entity_id,
                    kind: crate::domain::DeviceKind::SpaceHeating,
                    signal: ControlSignal::SetpointC,
                    control: from_steps(horizon, &setpoints),
                    temperature_c: Some(from_steps(horizon, &setpoints)),
                    soc_wh: None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CriticalAction, DeviceSpec};
    use crate::solver::SolveOptions;
    use chrono::{Duration, TimeZone, Utc};
    use ndarray::array;

    fn horizon(steps: usize) -> Horizon {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        Horizon::new(start, start + Duration::hours(steps as i64), Duration::hours(1)).unwrap()
    }

    fn params() -> SpaceHeatingParams {
        SpaceHeatingParams {
            zones: 2,
            heaters: 2,
            max_total_power_kw: 16.0,
            ramp_kw_per_step: 2.0,
            t_min_c: 15.0,
            t_max_c: 26.0,
            comfort_band_c: 0.5,
            weather_channels: 2,
        }
    }

    fn thermal() -> ThermalModel {
        ThermalModel {
            ax: array![[0.90, 0.03], [0.02, 0.91]],
            au: array![[0.8, 0.1], [0.1, 0.7]],
            aw: array![[0.07, 0.0], [0.07, 0.0]],
            learned_at: Utc::now(),
        }
    }

    fn device() -> Device {
        Device {
            entity_id: "sh-1".to_string(),
            priority: 5,
            critical_action: CriticalAction::MinimumSetpoint { setpoint_c: 15.0 },
            spec: DeviceSpec::SpaceHeating(params()),
        }
    }

    fn inputs(steps: usize) -> SpaceHeatingInputs {
        SpaceHeatingInputs {
            t_initial_c: vec![20.0, 20.0],
            desired_c: vec![vec![21.0; steps]; 2],
            occupancy: vec![vec![1.0; steps]; 2],
            disturbances: vec![vec![0.0; steps]; 2],
            thermal: thermal(),
        }
    }

    #[test]
    fn tracks_setpoint_with_bounded_power() {
        let steps = 4;
        let horizon = horizon(steps);
        let model = SpaceHeatingModel::new(device(), params(), inputs(steps)).unwrap();
        let mut pb = ProblemBuilder::new();
        let built = model.build(&mut pb, &horizon).unwrap();
        let solution = pb.solve(&SolveOptions::default());
        assert!(solution.status.is_accepted(), "status: {}", solution.status);

        let series = built.interpret(&solution, &horizon);
        assert_eq!(series.len(), 2);
        for zone_series in &series {
            for (_, &setpoint) in zone_series.control.iter() {
                assert!((15.0..=26.0).contains(&setpoint));
            }
        }
    }

    #[test]
    fn ramp_limit_holds_between_steps() {
        let steps = 5;
        let horizon = horizon(steps);
        let mut cold = inputs(steps);
        cold.t_initial_c = vec![15.5, 15.5];
        cold.desired_c = vec![vec![24.0; steps]; 2];
        let model = SpaceHeatingModel::new(device(), params(), cold).unwrap();
        let mut pb = ProblemBuilder::new();
        let built = model.build(&mut pb, &horizon).unwrap();
        let solution = pb.solve(&SolveOptions::default());
        assert!(solution.status.is_accepted(), "status: {}", solution.status);

        let dispatch = built.dispatch_kw();
        assert_eq!(dispatch.len(), steps);
        let totals: Vec<f64> = dispatch.iter().map(|d| d.eval(&solution.x)).collect();
        for &total in &totals {
            assert!((-1e-9..=16.0 + 1e-9).contains(&total));
        }
        // With two heaters each ramp-limited to 2 kW, the total can move by
        // at most 4 kW between steps.
        for pair in totals.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= 4.0 + 1e-6);
        }
    }

    #[test]
    fn rejects_mismatched_thermal_model() {
        let steps = 2;
        let mut bad = inputs(steps);
        bad.thermal = ThermalModel::fallback(3, 2, 2, Utc::now());
        let result = SpaceHeatingModel::new(device(), params(), bad);
        assert!(matches!(result, Err(ControlError::ModelLoadFailed(_))));
    }

    #[test]
    fn rejects_short_preference_series() {
        let steps = 3;
        let horizon = horizon(steps);
        let mut short = inputs(steps);
        short.desired_c[0].pop();
        let model = SpaceHeatingModel::new(device(), params(), short).unwrap();
        let mut pb = ProblemBuilder::new();
        assert!(matches!(
            model.build(&mut pb, &horizon),
            Err(ControlError::DataUnavailable(_))
        ));
    }
}
