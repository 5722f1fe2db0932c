//! Lowering to the Clarabel interior-point solver.
//!
//! Clarabel solves `minimize ½xᵀPx + qᵀx subject to Ax + s = b, s ∈ K`.
//! Equality rows map to the zero cone, inequality rows and finite variable
//! bounds to the nonnegative cone. `P` is supplied upper-triangular.

use std::time::Duration;

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};

use super::{ProblemBuilder, Solution, SolveStatus};

/// Column-wise sparse accumulator, converted to CSC at the end.
struct CscBuilder {
    nrows: usize,
    columns: Vec<Vec<(usize, f64)>>,
}

impl CscBuilder {
    fn new(ncols: usize) -> Self {
        Self { nrows: 0, columns: vec![Vec::new(); ncols] }
    }

    fn push(&mut self, row: usize, col: usize, value: f64) {
        if value != 0.0 {
            self.columns[col].push((row, value));
        }
        self.nrows = self.nrows.max(row + 1);
    }

    fn set_rows(&mut self, nrows: usize) {
        self.nrows = self.nrows.max(nrows);
    }

    fn build(mut self) -> CscMatrix<f64> {
        let ncols = self.columns.len();
        let mut colptr = Vec::with_capacity(ncols + 1);
        let mut rowval = Vec::new();
        let mut nzval = Vec::new();
        let mut nnz = 0usize;
        for column in &mut self.columns {
            colptr.push(nnz);
            column.sort_unstable_by_key(|(row, _)| *row);
            for &(row, value) in column.iter() {
                rowval.push(row);
                nzval.push(value);
                nnz += 1;
            }
        }
        colptr.push(nnz);
        CscMatrix::new(self.nrows, ncols, colptr, rowval, nzval)
    }
}

/// Solve the continuous relaxation of `pb` with the given (possibly
/// tightened) variable bounds.
pub(super) fn solve_continuous(pb: &ProblemBuilder, lower: &[f64], upper: &[f64]) -> Solution {
    let n = pb.num_vars();

    // Quadratic cost, upper triangle.
    let mut p = CscBuilder::new(n);
    for (&(i, j), &value) in &pb.quad {
        p.push(i, j, value);
    }
    p.set_rows(n);
    let p_mat = p.build();
    let q = pb.linear.clone();

    // Constraint matrix: equalities first, then inequalities, then bounds.
    let mut a = CscBuilder::new(n);
    let mut b = Vec::new();
    let mut row = 0usize;

    for (expr, rhs) in &pb.eq_rows {
        let (terms, constant) = expr.compressed();
        for (index, coeff) in terms {
            a.push(row, index, coeff);
        }
        b.push(rhs - constant);
        row += 1;
    }
    let n_eq = row;

    for (expr, rhs) in &pb.ineq_rows {
        let (terms, constant) = expr.compressed();
        for (index, coeff) in terms {
            a.push(row, index, coeff);
        }
        b.push(rhs - constant);
        row += 1;
    }
    for index in 0..n {
        if upper[index].is_finite() {
            a.push(row, index, 1.0);
            b.push(upper[index]);
            row += 1;
        }
        if lower[index].is_finite() {
            a.push(row, index, -1.0);
            b.push(-lower[index]);
            row += 1;
        }
    }
    let n_ineq = row - n_eq;
    a.set_rows(row);
    let a_mat = a.build();

    let mut cones: Vec<SupportedConeT<f64>> = Vec::with_capacity(2);
    if n_eq > 0 {
        cones.push(SupportedConeT::ZeroConeT(n_eq));
    }
    if n_ineq > 0 {
        cones.push(SupportedConeT::NonnegativeConeT(n_ineq));
    }

    let settings = match DefaultSettingsBuilder::default().verbose(false).build() {
        Ok(settings) => settings,
        Err(e) => return Solution::rejected(SolveStatus::Error(format!("settings: {e:?}"))),
    };

    let mut solver = match DefaultSolver::new(&p_mat, &q, &a_mat, &b, &cones, settings) {
        Ok(solver) => solver,
        Err(e) => return Solution::rejected(SolveStatus::Error(format!("setup: {e:?}"))),
    };
    solver.solve();
    let raw = solver.solution;

    let status = match raw.status {
        SolverStatus::Solved => SolveStatus::Optimal,
        SolverStatus::AlmostSolved => SolveStatus::OptimalInaccurate,
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
            SolveStatus::Infeasible
        }
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => SolveStatus::Unbounded,
        other => SolveStatus::Error(format!("{other:?}")),
    };

    if !status.is_accepted() {
        let mut rejected = Solution::rejected(status);
        rejected.solve_time = Duration::from_secs_f64(raw.solve_time);
        rejected.iterations = raw.iterations as usize;
        return rejected;
    }

    Solution {
        status,
        objective: raw.obj_val + pb.objective_offset,
        x: raw.x,
        solve_time: Duration::from_secs_f64(raw.solve_time),
        iterations: raw.iterations as usize,
        nodes_explored: 0,
    }
}
