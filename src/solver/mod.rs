//! Convex optimization layer.
//!
//! The planner and the thermal-model learner both describe their problems
//! through [`ProblemBuilder`]: bounded continuous (or binary) variables,
//! linear equality/inequality constraints, and an objective assembled from
//! linear and squared-linear terms. Binary-free problems are handed straight
//! to the Clarabel interior-point backend; problems with binaries go through
//! a best-first branch-and-bound with the continuous relaxation as the node
//! bound.

mod conic;
mod mip;

use std::collections::HashMap;
use std::time::Duration;

/// Handle to a decision variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(pub(crate) usize);

impl Var {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// A linear expression `Σ cᵢ·xᵢ + b`.
#[derive(Debug, Clone, Default)]
pub struct LinExpr {
    pub(crate) terms: Vec<(usize, f64)>,
    pub(crate) constant: f64,
}

impl LinExpr {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self { terms: Vec::new(), constant: value }
    }

    pub fn term(var: Var, coeff: f64) -> Self {
        Self { terms: vec![(var.index(), coeff)], constant: 0.0 }
    }

    pub fn add_term(&mut self, var: Var, coeff: f64) {
        self.terms.push((var.index(), coeff));
    }

    pub fn add_constant(&mut self, value: f64) {
        self.constant += value;
    }

    pub fn plus(mut self, other: LinExpr) -> Self {
        self.terms.extend(other.terms);
        self.constant += other.constant;
        self
    }

    pub fn minus(self, other: LinExpr) -> Self {
        self.plus(other.scaled(-1.0))
    }

    pub fn scaled(mut self, factor: f64) -> Self {
        for (_, coeff) in &mut self.terms {
            *coeff *= factor;
        }
        self.constant *= factor;
        self
    }

    /// Merge duplicate variable terms, dropping exact zeros.
    pub(crate) fn compressed(&self) -> (Vec<(usize, f64)>, f64) {
        let mut merged: HashMap<usize, f64> = HashMap::with_capacity(self.terms.len());
        for &(index, coeff) in &self.terms {
            *merged.entry(index).or_insert(0.0) += coeff;
        }
        let mut terms: Vec<(usize, f64)> =
            merged.into_iter().filter(|(_, coeff)| *coeff != 0.0).collect();
        terms.sort_unstable_by_key(|(index, _)| *index);
        (terms, self.constant)
    }

    pub fn eval(&self, x: &[f64]) -> f64 {
        self.terms.iter().map(|&(i, c)| c * x[i]).sum::<f64>() + self.constant
    }
}

impl From<Var> for LinExpr {
    fn from(var: Var) -> Self {
        LinExpr::term(var, 1.0)
    }
}

impl std::ops::Add for LinExpr {
    type Output = LinExpr;
    fn add(self, rhs: LinExpr) -> LinExpr {
        self.plus(rhs)
    }
}

impl std::ops::Sub for LinExpr {
    type Output = LinExpr;
    fn sub(self, rhs: LinExpr) -> LinExpr {
        self.minus(rhs)
    }
}

impl std::ops::Mul<f64> for LinExpr {
    type Output = LinExpr;
    fn mul(self, rhs: f64) -> LinExpr {
        self.scaled(rhs)
    }
}

/// Terminal state of a solve.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveStatus {
    Optimal,
    OptimalInaccurate,
    Infeasible,
    Unbounded,
    Error(String),
}

impl SolveStatus {
    /// Whether the solution is usable for dispatch.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::OptimalInaccurate)
    }
}

impl std::fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveStatus::Optimal => write!(f, "OPTIMAL"),
            SolveStatus::OptimalInaccurate => write!(f, "OPTIMAL_INACCURATE"),
            SolveStatus::Infeasible => write!(f, "INFEASIBLE"),
            SolveStatus::Unbounded => write!(f, "UNBOUNDED"),
            SolveStatus::Error(reason) => write!(f, "SOLVER_ERROR({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub status: SolveStatus,
    pub x: Vec<f64>,
    pub objective: f64,
    pub solve_time: Duration,
    pub iterations: usize,
    /// Branch-and-bound nodes explored; 0 for purely continuous solves.
    pub nodes_explored: usize,
}

impl Solution {
    pub fn value(&self, var: Var) -> f64 {
        self.x[var.index()]
    }

    pub fn eval(&self, expr: &LinExpr) -> f64 {
        expr.eval(&self.x)
    }

    pub(crate) fn rejected(status: SolveStatus) -> Self {
        Self {
            status,
            x: Vec::new(),
            objective: f64::INFINITY,
            solve_time: Duration::ZERO,
            iterations: 0,
            nodes_explored: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveOptions {
    /// Branch-and-bound node budget. When exhausted the best incumbent (or
    /// a rounded relaxation) is returned as `OptimalInaccurate`.
    pub node_budget: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self { node_budget: 500 }
    }
}

/// Minimization problem under construction.
#[derive(Debug, Default)]
pub struct ProblemBuilder {
    lower: Vec<f64>,
    upper: Vec<f64>,
    binaries: Vec<usize>,
    eq_rows: Vec<(LinExpr, f64)>,
    ineq_rows: Vec<(LinExpr, f64)>,
    quad: HashMap<(usize, usize), f64>,
    linear: Vec<f64>,
    objective_offset: f64,
}

impl ProblemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bounded continuous variable. Use `f64::INFINITY` /
    /// `f64::NEG_INFINITY` for one-sided bounds.
    pub fn var(&mut self, lower: f64, upper: f64) -> Var {
        debug_assert!(lower <= upper, "variable bounds are inverted");
        self.lower.push(lower);
        self.upper.push(upper);
        self.linear.push(0.0);
        Var(self.lower.len() - 1)
    }

    /// Add a {0,1} decision variable.
    pub fn binary(&mut self) -> Var {
        let var = self.var(0.0, 1.0);
        self.binaries.push(var.index());
        var
    }

    /// Pin a variable to a constant by collapsing its bounds.
    pub fn fix(&mut self, var: Var, value: f64) {
        self.lower[var.index()] = value;
        self.upper[var.index()] = value;
    }

    pub fn eq(&mut self, expr: LinExpr, rhs: f64) {
        self.eq_rows.push((expr, rhs));
    }

    pub fn le(&mut self, expr: LinExpr, rhs: f64) {
        self.ineq_rows.push((expr, rhs));
    }

    pub fn ge(&mut self, expr: LinExpr, rhs: f64) {
        self.ineq_rows.push((expr.scaled(-1.0), -rhs));
    }

    /// Add `weight · expr` to the objective.
    pub fn linear_cost(&mut self, expr: &LinExpr, weight: f64) {
        for &(index, coeff) in &expr.terms {
            self.linear[index] += weight * coeff;
        }
        self.objective_offset += weight * expr.constant;
    }

    /// Add `weight · expr²` to the objective. `weight` must be nonnegative
    /// to keep the problem convex.
    pub fn quadratic_cost(&mut self, expr: &LinExpr, weight: f64) {
        debug_assert!(weight >= 0.0, "negative quadratic weight breaks convexity");
        let (terms, constant) = expr.compressed();
        for (a, &(i, ci)) in terms.iter().enumerate() {
            for &(j, cj) in &terms[a..] {
                let key = if i <= j { (i, j) } else { (j, i) };
                *self.quad.entry(key).or_insert(0.0) += 2.0 * weight * ci * cj;
            }
            self.linear[i] += 2.0 * weight * constant * ci;
        }
        self.objective_offset += weight * constant * constant;
    }

    pub fn num_vars(&self) -> usize {
        self.lower.len()
    }

    pub fn has_binaries(&self) -> bool {
        !self.binaries.is_empty()
    }

    pub fn solve(&self, options: &SolveOptions) -> Solution {
        // Binaries whose bounds were collapsed by `fix` need no branching.
        let open: Vec<usize> = self
            .binaries
            .iter()
            .copied()
            .filter(|&i| self.upper[i] - self.lower[i] > f64::EPSILON)
            .collect();
        if open.is_empty() {
            conic::solve_continuous(self, &self.lower, &self.upper)
        } else {
            mip::branch_and_bound(self, &open, options)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_quadratic_minimum() {
        // minimize (x - 3)²  →  x = 3
        let mut pb = ProblemBuilder::new();
        let x = pb.var(f64::NEG_INFINITY, f64::INFINITY);
        let dev = LinExpr::from(x).minus(LinExpr::constant(3.0));
        pb.quadratic_cost(&dev, 1.0);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted(), "status: {}", sol.status);
        assert!((sol.value(x) - 3.0).abs() < 1e-6);
        assert!(sol.objective.abs() < 1e-6);
    }

    #[test]
    fn linear_program_hits_bound() {
        // minimize 2x subject to x ≥ 1.5
        let mut pb = ProblemBuilder::new();
        let x = pb.var(1.5, 10.0);
        pb.linear_cost(&LinExpr::from(x), 2.0);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted());
        assert!((sol.value(x) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn equality_constraint_binds() {
        // minimize x² + y² subject to x + y = 2  →  x = y = 1
        let mut pb = ProblemBuilder::new();
        let x = pb.var(f64::NEG_INFINITY, f64::INFINITY);
        let y = pb.var(f64::NEG_INFINITY, f64::INFINITY);
        pb.quadratic_cost(&LinExpr::from(x), 1.0);
        pb.quadratic_cost(&LinExpr::from(y), 1.0);
        pb.eq(LinExpr::from(x).plus(LinExpr::from(y)), 2.0);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted());
        assert!((sol.value(x) - 1.0).abs() < 1e-5);
        assert!((sol.value(y) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn infeasible_bounds_are_reported() {
        let mut pb = ProblemBuilder::new();
        let x = pb.var(0.0, 1.0);
        pb.ge(LinExpr::from(x), 2.0);
        pb.linear_cost(&LinExpr::from(x), 1.0);

        let sol = pb.solve(&SolveOptions::default());
        assert_eq!(sol.status, SolveStatus::Infeasible);
    }

    #[test]
    fn cross_term_quadratic_expands_correctly() {
        // minimize (x - y - 1)² + x²: the first-order conditions give
        // x - y = 1 and x = 0, so the optimum is (0, -1).
        let mut pb = ProblemBuilder::new();
        let x = pb.var(f64::NEG_INFINITY, f64::INFINITY);
        let y = pb.var(f64::NEG_INFINITY, f64::INFINITY);
        let dev = LinExpr::from(x).minus(LinExpr::from(y)).minus(LinExpr::constant(1.0));
        pb.quadratic_cost(&dev, 1.0);
        pb.quadratic_cost(&LinExpr::from(x), 1.0);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted());
        assert!(sol.value(x).abs() < 1e-5, "x = {}", sol.value(x));
        assert!((sol.value(y) + 1.0).abs() < 1e-5, "y = {}", sol.value(y));
    }

    #[test]
    fn binary_knapsack_picks_best_item() {
        // maximize 3a + 2b with a + b ≤ 1 → minimize -(3a + 2b): pick a.
        let mut pb = ProblemBuilder::new();
        let a = pb.binary();
        let b = pb.binary();
        pb.le(LinExpr::from(a).plus(LinExpr::from(b)), 1.0);
        pb.linear_cost(&LinExpr::from(a), -3.0);
        pb.linear_cost(&LinExpr::from(b), -2.0);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted());
        assert!((sol.value(a) - 1.0).abs() < 1e-4);
        assert!(sol.value(b).abs() < 1e-4);
        assert!(sol.nodes_explored >= 1);
    }

    #[test]
    fn fixed_binaries_skip_branching() {
        let mut pb = ProblemBuilder::new();
        let a = pb.binary();
        pb.fix(a, 0.0);
        pb.linear_cost(&LinExpr::from(a), -1.0);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted());
        assert_eq!(sol.nodes_explored, 0);
        assert!(sol.value(a).abs() < 1e-8);
    }
}
