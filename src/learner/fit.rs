//! Regularized least-squares identification of the zone thermal dynamics.
//!
//! Each zone row of `(Ax | Au | Aw)` is an independent constrained ridge
//! regression: minimize the one-step prediction error over the trace plus a
//! ridge penalty, subject to nonnegative heater gains, a row-sum bound on
//! `Ax`, and a nonnegative diagonal. The rows share the solver layer with
//! the planner.

use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView2};
use tracing::debug;

use crate::domain::{ControlError, ThermalModel};
use crate::solver::{LinExpr, ProblemBuilder, SolveOptions};

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub lambda_x: f64,
    pub lambda_u: f64,
    pub lambda_w: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self { lambda_x: 0.1, lambda_u: 0.1, lambda_w: 0.1 }
    }
}

/// Fit `(Ax, Au, Aw)` from aligned traces.
///
/// `x` is `Z×M` zone temperatures, `u` is `U×M` heater powers, `w` is `D×M`
/// weather channels; columns are simultaneous samples. Requires at least
/// `Z·(Z+U+D)+1` samples.
pub fn fit_thermal_model(
    x: ArrayView2<f64>,
    u: ArrayView2<f64>,
    w: ArrayView2<f64>,
    options: &FitOptions,
    learned_at: DateTime<Utc>,
) -> Result<ThermalModel, ControlError> {
    let zones = x.nrows();
    let heaters = u.nrows();
    let channels = w.nrows();
    let samples = x.ncols();

    if zones == 0 {
        return Err(ControlError::ModelLearnFailed("no zones in trace".into()));
    }
    if u.ncols() != samples || w.ncols() != samples {
        return Err(ControlError::ModelLearnFailed(format!(
            "trace lengths differ: x={samples}, u={}, w={}",
            u.ncols(),
            w.ncols()
        )));
    }
    let unknowns = zones + heaters + channels;
    let min_samples = zones * unknowns + 1;
    if samples < min_samples {
        return Err(ControlError::ModelLearnFailed(format!(
            "insufficient samples: {samples} < {min_samples}"
        )));
    }

    let mut ax = Array2::zeros((zones, zones));
    let mut au = Array2::zeros((zones, heaters));
    let mut aw = Array2::zeros((zones, channels));

    for z in 0..zones {
        let mut pb = ProblemBuilder::new();

        // Row unknowns: ax row, au row (nonnegative), aw row.
        let ax_row: Vec<_> = (0..zones)
            .map(|z2| {
                if z2 == z {
                    // Diagonal of Ax must stay nonnegative.
                    pb.var(0.0, f64::INFINITY)
                } else {
                    pb.var(f64::NEG_INFINITY, f64::INFINITY)
                }
            })
            .collect();
        let au_row: Vec<_> = (0..heaters).map(|_| pb.var(0.0, f64::INFINITY)).collect();
        let aw_row: Vec<_> =
            (0..channels).map(|_| pb.var(f64::NEG_INFINITY, f64::INFINITY)).collect();

        // Row-sum stability bound on Ax.
        let mut row_sum = LinExpr::zero();
        for &var in &ax_row {
            row_sum.add_term(var, 1.0);
        }
        pb.le(row_sum, 1.0);

        // One-step prediction residuals.
        for m in 0..samples - 1 {
            let mut prediction = LinExpr::constant(-x[(z, m + 1)]);
            for (z2, &var) in ax_row.iter().enumerate() {
                prediction.add_term(var, x[(z2, m)]);
            }
            for (h, &var) in au_row.iter().enumerate() {
                prediction.add_term(var, u[(h, m)]);
            }
            for (d, &var) in aw_row.iter().enumerate() {
                prediction.add_term(var, w[(d, m)]);
            }
            pb.quadratic_cost(&prediction, 1.0);
        }

        // Ridge penalties.
        for &var in &ax_row {
            pb.quadratic_cost(&LinExpr::from(var), options.lambda_x);
        }
        for &var in &au_row {
            pb.quadratic_cost(&LinExpr::from(var), options.lambda_u);
        }
        for &var in &aw_row {
            pb.quadratic_cost(&LinExpr::from(var), options.lambda_w);
        }

        let solution = pb.solve(&SolveOptions::default());
        if !solution.status.is_accepted() {
            return Err(ControlError::ModelLearnFailed(format!(
                "zone {z} regression failed with status {}",
                solution.status
            )));
        }
        debug!(zone = z, objective = solution.objective, "fitted thermal row");

        for (z2, &var) in ax_row.iter().enumerate() {
            ax[(z, z2)] = solution.value(var);
        }
        for (h, &var) in au_row.iter().enumerate() {
            au[(z, h)] = solution.value(var);
        }
        for (d, &var) in aw_row.iter().enumerate() {
            aw[(z, d)] = solution.value(var);
        }
    }

    let model = ThermalModel { ax, au, aw, learned_at };
    model
        .validate()
        .map_err(|e| ControlError::ModelLearnFailed(format!("fitted model invalid: {e}")))?;
    Ok(model)
}
