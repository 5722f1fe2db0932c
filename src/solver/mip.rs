//! Best-first branch-and-bound over binary variables.
//!
//! Every node solves the continuous relaxation with tightened bounds; the
//! relaxation objective is an admissible bound, so nodes worse than the
//! incumbent are pruned. A node budget caps the search; when it is hit the
//! incumbent (or a rounded-and-fixed relaxation) is returned with the
//! `OptimalInaccurate` status.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use ordered_float::OrderedFloat;

use super::{conic, ProblemBuilder, Solution, SolveOptions, SolveStatus};

const INTEGRALITY_TOL: f64 = 1e-6;

struct Node {
    bound: Reverse<OrderedFloat<f64>>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.bound == other.bound
    }
}
impl Eq for Node {}
impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bound.cmp(&other.bound)
    }
}

fn most_fractional(x: &[f64], binaries: &[usize]) -> Option<usize> {
    binaries
        .iter()
        .copied()
        .filter(|&i| (x[i] - x[i].round()).abs() > INTEGRALITY_TOL)
        .max_by_key(|&i| OrderedFloat((x[i] - x[i].round()).abs()))
}

pub(super) fn branch_and_bound(
    pb: &ProblemBuilder,
    binaries: &[usize],
    options: &SolveOptions,
) -> Solution {
    let mut heap: BinaryHeap<Node> = BinaryHeap::new();
    heap.push(Node {
        bound: Reverse(OrderedFloat(f64::NEG_INFINITY)),
        lower: pb.lower.clone(),
        upper: pb.upper.clone(),
    });

    let mut incumbent: Option<Solution> = None;
    let mut explored = 0usize;
    let mut total_time = Duration::ZERO;
    let mut exhausted = false;

    while let Some(node) = heap.pop() {
        if explored >= options.node_budget {
            exhausted = true;
            break;
        }
        if let Some(best) = &incumbent {
            if node.bound.0 .0 >= best.objective - INTEGRALITY_TOL {
                continue;
            }
        }

        let relaxed = conic::solve_continuous(pb, &node.lower, &node.upper);
        explored += 1;
        total_time += relaxed.solve_time;

        match relaxed.status {
            SolveStatus::Infeasible => continue,
            SolveStatus::Unbounded => {
                return finish(relaxed, explored, total_time);
            }
            SolveStatus::Error(_) => return finish(relaxed, explored, total_time),
            _ => {}
        }
        if let Some(best) = &incumbent {
            if relaxed.objective >= best.objective - INTEGRALITY_TOL {
                continue;
            }
        }

        match most_fractional(&relaxed.x, binaries) {
            None => {
                // Integral relaxation: new incumbent.
                incumbent = Some(relaxed);
            }
            Some(branch_var) => {
                let bound = Reverse(OrderedFloat(relaxed.objective));

                let mut down_upper = node.upper.clone();
                down_upper[branch_var] = 0.0;
                heap.push(Node {
                    bound: bound.clone(),
                    lower: node.lower.clone(),
                    upper: down_upper,
                });

                let mut up_lower = node.lower.clone();
                up_lower[branch_var] = 1.0;
                heap.push(Node { bound, lower: up_lower, upper: node.upper });
            }
        }
    }

    match incumbent {
        Some(mut best) => {
            best.status = if exhausted {
                SolveStatus::OptimalInaccurate
            } else {
                SolveStatus::Optimal
            };
            finish(best, explored, total_time)
        }
        None if exhausted => rounded_fallback(pb, binaries, explored, total_time),
        None => {
            let mut rejected = Solution::rejected(SolveStatus::Infeasible);
            rejected.nodes_explored = explored;
            rejected.solve_time = total_time;
            rejected
        }
    }
}

/// Budget ran out before any integral point was found: round the root
/// relaxation, pin the binaries, and re-solve the remaining convex problem.
fn rounded_fallback(
    pb: &ProblemBuilder,
    binaries: &[usize],
    explored: usize,
    total_time: Duration,
) -> Solution {
    let root = conic::solve_continuous(pb, &pb.lower, &pb.upper);
    let total_time = total_time + root.solve_time;
    if !root.status.is_accepted() {
        return finish(root, explored, total_time);
    }

    let mut lower = pb.lower.clone();
    let mut upper = pb.upper.clone();
    for &index in binaries {
        let rounded = root.x[index].round().clamp(0.0, 1.0);
        lower[index] = rounded;
        upper[index] = rounded;
    }

    let mut fixed = conic::solve_continuous(pb, &lower, &upper);
    let total_time = total_time + fixed.solve_time;
    if fixed.status.is_accepted() {
        fixed.status = SolveStatus::OptimalInaccurate;
    }
    finish(fixed, explored + 2, total_time)
}

fn finish(mut solution: Solution, explored: usize, total_time: Duration) -> Solution {
    solution.nodes_explored = explored;
    solution.solve_time = total_time;
    solution
}

#[cfg(test)]
mod tests {
    use super::super::{LinExpr, ProblemBuilder, SolveOptions, SolveStatus};

    #[test]
    fn mixed_problem_with_quadratic_tracking() {
        // Two on/off 2 kW loads tracking a 3 kW target: exactly one runs.
        let mut pb = ProblemBuilder::new();
        let a = pb.binary();
        let b = pb.binary();
        let power = LinExpr::term(a, 2.0).plus(LinExpr::term(b, 2.0));
        let deviation = power.clone().minus(LinExpr::constant(3.0));
        pb.quadratic_cost(&deviation, 1.0);
        // Mild preference for the first unit.
        pb.linear_cost(&LinExpr::from(b), 0.1);

        let sol = pb.solve(&SolveOptions::default());
        assert!(sol.status.is_accepted(), "status: {}", sol.status);
        assert!((sol.value(a) - 1.0).abs() < 1e-4);
        assert!(sol.value(b).abs() < 1e-4);
    }

    #[test]
    fn infeasible_integer_problem() {
        // a + b = 1 with both forced on is infeasible.
        let mut pb = ProblemBuilder::new();
        let a = pb.binary();
        let b = pb.binary();
        pb.eq(LinExpr::from(a).plus(LinExpr::from(b)), 1.0);
        pb.ge(LinExpr::from(a), 1.0);
        pb.ge(LinExpr::from(b), 1.0);
        pb.linear_cost(&LinExpr::from(a), 1.0);

        let sol = pb.solve(&SolveOptions::default());
        assert_eq!(sol.status, SolveStatus::Infeasible);
    }

    #[test]
    fn tiny_node_budget_still_returns_a_point() {
        let mut pb = ProblemBuilder::new();
        let mut total = LinExpr::zero();
        for _ in 0..6 {
            let u = pb.binary();
            total.add_term(u, 1.0);
        }
        let deviation = total.minus(LinExpr::constant(2.5));
        pb.quadratic_cost(&deviation, 1.0);

        let sol = pb.solve(&SolveOptions { node_budget: 1 });
        assert!(sol.status.is_accepted(), "status: {}", sol.status);
        // Every binary must be integral even under the fallback path.
        for index in 0..6 {
            let v = sol.x[index];
            assert!((v - v.round()).abs() < 1e-6);
        }
    }
}
