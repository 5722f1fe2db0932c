//! Stationary battery model.
//!
//! Charge/discharge split into two nonnegative power variables; exclusivity
//! is deliberately relaxed (round-trip losses plus a positive price make
//! simultaneous charge and discharge suboptimal). The interpreter detects
//! the degenerate case anyway and zeroes the smaller side.

use tracing::warn;

use crate::domain::series::from_steps;
use crate::domain::{ControlError, ControlSeries, ControlSignal, Device, Horizon, StorageParams};
use crate::solver::{LinExpr, ProblemBuilder, Solution, Var};

use super::{check_step_len, priority_weight, BuiltSubModel, SubModel};

/// Below this both-sides power (kW) the overlap is treated as solver noise.
const EXCLUSIVITY_TOL_KW: f64 = 1e-3;

pub struct StorageInputs {
    /// Residual energy at horizon start, Wh.
    pub e_initial_wh: f64,
    /// Desired residual energy per step, Wh.
    pub e_desired_wh: Vec<f64>,
    /// Optional terminal energy floor, Wh; overrides the device parameter.
    pub e_final_wh: Option<f64>,
}

pub struct StorageModel {
    device: Device,
    params: StorageParams,
    inputs: StorageInputs,
}

impl StorageModel {
    pub fn new(device: Device, params: StorageParams, inputs: StorageInputs) -> Self {
        Self { device, params, inputs }
    }
}

struct BuiltStorage {
    entity_id: String,
    charge_kw: Vec<Var>,
    discharge_kw: Vec<Var>,
    energy_wh: Vec<Var>,
    dispatch: Vec<LinExpr>,
}

impl SubModel for StorageModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn build(
        &self,
        pb: &mut ProblemBuilder,
        horizon: &Horizon,
    ) -> Result<Box<dyn BuiltSubModel>, ControlError> {
        let n = horizon.steps();
        check_step_len("storage desired energy", &self.inputs.e_desired_wh, horizon)?;

        let params = &self.params;
        if params.capacity_wh <= 0.0 || params.eta_charge <= 0.0 || params.eta_discharge <= 0.0 {
            return Err(ControlError::ConfigInvalid(format!(
                "storage {} has non-positive capacity or efficiency",
                self.device.entity_id
            )));
        }

        let charge_kw: Vec<Var> = (0..n).map(|_| pb.var(0.0, params.p_charge_max_kw)).collect();
        let discharge_kw: Vec<Var> =
            (0..n).map(|_| pb.var(0.0, params.p_discharge_max_kw)).collect();

        let mut energy_wh = Vec::with_capacity(n + 1);
        energy_wh.push(pb.var(self.inputs.e_initial_wh, self.inputs.e_initial_wh));
        for _ in 0..n {
            energy_wh.push(pb.var(params.e_min_wh, params.e_max_wh));
        }

        // E[k+1] = γ·E[k] + (η_c·p_c[k] − p_d[k]/η_d)·Δt, energies in Wh.
        let wh_per_kw_step = horizon.dt_hours() * 1000.0;
        for k in 0..n {
            let mut balance = LinExpr::from(energy_wh[k + 1]);
            balance.add_term(energy_wh[k], -params.retention);
            balance.add_term(charge_kw[k], -params.eta_charge * wh_per_kw_step);
            balance.add_term(discharge_kw[k], wh_per_kw_step / params.eta_discharge);
            pb.eq(balance, 0.0);
        }

        if let Some(e_final) = self.inputs.e_final_wh.or(params.e_final_wh) {
            pb.ge(LinExpr::from(energy_wh[n]), e_final);
        }

        // Comfort: normalized quadratic pull towards the desired energy.
        let weight = priority_weight(&self.device);
        for k in 0..n {
            let deviation = LinExpr::constant(self.inputs.e_desired_wh[k])
                .minus(LinExpr::from(energy_wh[k + 1]))
                .scaled(1.0 / params.capacity_wh);
            pb.quadratic_cost(&deviation, weight);
        }

        let dispatch: Vec<LinExpr> = (0..n)
            .map(|k| LinExpr::from(charge_kw[k]).minus(LinExpr::from(discharge_kw[k])))
            .collect();

        Ok(Box::new(BuiltStorage {
            entity_id: self.device.entity_id.clone(),
            charge_kw,
            discharge_kw,
            energy_wh,
            dispatch,
        }))
    }
}

impl BuiltSubModel for BuiltStorage {
    fn dispatch_kw(&self) -> &[LinExpr] {
        &self.dispatch
    }

    fn interpret(&self, solution: &Solution, horizon: &Horizon) -> Vec<ControlSeries> {
        let n = horizon.steps();
        let mut net_w = Vec::with_capacity(n);
        for k in 0..n {
            let mut charge = solution.value(self.charge_kw[k]);
            let mut discharge = solution.value(self.discharge_kw[k]);
            if charge > EXCLUSIVITY_TOL_KW && discharge > EXCLUSIVITY_TOL_KW {
                // Relaxation came back degenerate: keep the dominant side.
                warn!(
                    entity_id = %self.entity_id,
                    step = k,
                    charge_kw = charge,
                    discharge_kw = discharge,
                    "simultaneous charge and discharge in solution; zeroing the smaller side"
                );
                if charge >= discharge {
                    discharge = 0.0;
                } else {
                    charge = 0.0;
                }
            }
            net_w.push((charge - discharge) * 1000.0);
        }

        let soc: Vec<f64> = self.energy_wh[..n].iter().map(|&v| solution.value(v)).collect();

        vec![ControlSeries {
            entity_id: self.entity_id.clone(),
            kind: crate::domain::DeviceKind::ElectricStorage,
            signal: ControlSignal::PowerW,
            control: from_steps(horizon, &net_w),
            temperature_c: None,
            soc_wh: Some(from_steps(horizon, &soc)),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CriticalAction, DeviceSpec};
    use crate::solver::SolveOptions;
    use chrono::{Duration, TimeZone, Utc};

    fn horizon(steps: usize) -> Horizon {
        let start = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        Horizon::new(start, start + Duration::hours(steps as i64), Duration::hours(1)).unwrap()
    }

    fn params() -> StorageParams {
        StorageParams {
            capacity_wh: 10_000.0,
            e_min_wh: 1_000.0,
            e_max_wh: 9_500.0,
            p_charge_max_kw: 5.0,
            p_discharge_max_kw: 5.0,
            eta_charge: 0.95,
            eta_discharge: 0.95,
            retention: 1.0,
            e_final_wh: None,
        }
    }

    fn device() -> Device {
        Device {
            entity_id: "bat-1".to_string(),
            priority: 3,
            critical_action: CriticalAction::PowerOff,
            spec: DeviceSpec::ElectricStorage(params()),
        }
    }

    #[test]
    fn charges_towards_desired_energy() {
        let steps = 4;
        let horizon = horizon(steps);
        let model = StorageModel::new(
            device(),
            params(),
            StorageInputs {
                e_initial_wh: 2_000.0,
                e_desired_wh: vec![8_000.0; steps],
                e_final_wh: None,
            },
        );
        let mut pb = ProblemBuilder::new();
        let built = model.build(&mut pb, &horizon).unwrap();
        let solution = pb.solve(&SolveOptions::default());
        assert!(solution.status.is_accepted(), "status: {}", solution.status);

        let series = built.interpret(&solution, &horizon);
        let soc = series[0].soc_wh.as_ref().unwrap();
        let last = soc.iter().last().map(|(_, &v)| v).unwrap();
        assert!(last > 6_000.0, "battery barely charged: {last} Wh");

        for (_, &p) in series[0].control.iter() {
            assert!(p >= -5_000.0 - 1.0 && p <= 5_000.0 + 1.0);
        }
    }

    #[test]
    fn terminal_floor_is_respected() {
        let steps = 2;
        let horizon = horizon(steps);
        let model = StorageModel::new(
            device(),
            params(),
            StorageInputs {
                e_initial_wh: 2_000.0,
                e_desired_wh: vec![2_000.0; steps],
                e_final_wh: Some(7_000.0),
            },
        );
        let mut pb = ProblemBuilder::new();
        let built = model.build(&mut pb, &horizon).unwrap();
        let solution = pb.solve(&SolveOptions::default());
        assert!(solution.status.is_accepted(), "status: {}", solution.status);

        let series = built.interpret(&solution, &horizon);
        // Final energy is not in the reported state series (which covers step
        // starts), so recheck via the net power: enough charging must happen
        // to lift 2000 Wh above 7000 Wh.
        let charged_wh: f64 = series[0]
            .control
            .iter()
            .map(|(_, &w)| (w / 1000.0).max(0.0) * 0.95 * 1000.0)
            .sum();
        assert!(charged_wh >= 4_900.0, "charged only {charged_wh} Wh");
    }
}
