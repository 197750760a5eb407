//! Mixed-integer conic backend: branch and bound over the binary variables, every node
//! relaxation solved by Clarabel.
//!
//! Node relaxations are `min ½xᵀPx + qᵀx` subject to `Ax + s = b`, with the rows of `A` grouped as
//! zero cone (equalities, fixed variables), nonnegative cone (inequalities, variable bounds) and one
//! second order cone per Lorentz cone constraint.
//!
//! The search dives depth first until an incumbent exists and runs best first afterwards. Incumbents
//! also come from fixing the binaries at the initial guess, or at a rounded relaxation, and solving
//! the continuous rest.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::{Duration, Instant};

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettings, DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{self, NonnegativeConeT, SecondOrderConeT, ZeroConeT},
};
use nalgebra::DVector;
use ordered_float::OrderedFloat;
use tracing::{debug, info, trace, warn};

use crate::error::{IkError, IkResult};
use crate::mathematical_program::{LinearExpression, MathematicalProgram, Variable};
use crate::solution_result::{MathematicalProgramResult, SolutionResult, SolverId};
use crate::solver_options::SolverOptions;

/// Sparse matrix under construction. Duplicate entries are summed.
#[derive(Default)]
struct Triplets {
    entries: BTreeMap<(usize, usize), f64>,
}

impl Triplets {
    fn add(&mut self, row: usize, col: usize, value: f64) {
        if value != 0.0 {
            *self.entries.entry((row, col)).or_insert(0.0) += value;
        }
    }

    fn into_csc(self, m: usize, n: usize) -> CscMatrix<f64> {
        if self.entries.is_empty() {
            return CscMatrix::zeros((m, n));
        }
        let mut rows = Vec::with_capacity(self.entries.len());
        let mut cols = Vec::with_capacity(self.entries.len());
        let mut vals = Vec::with_capacity(self.entries.len());
        for ((r, c), v) in self.entries {
            rows.push(r);
            cols.push(c);
            vals.push(v);
        }
        CscMatrix::new_from_triplets(m, n, rows, cols, vals)
    }
}

/// Rows of one cone block: `s = b - A x`.
#[derive(Default)]
struct RowBlock {
    A: Triplets,
    b: Vec<f64>,
}

impl RowBlock {
    /// Appends `sign * (expression - rhs)` as `s = b - A x`, i.e. `A = -sign * a`, `b = sign * (c - rhs)`.
    fn push(&mut self, expression: &LinearExpression, sign: f64, rhs: f64) {
        let row = self.b.len();
        for (v, c) in expression.terms() {
            self.A.add(row, v.index(), -sign * c);
        }
        self.b.push(sign * (expression.constant_term() - rhs));
    }

    fn len(&self) -> usize {
        self.b.len()
    }
}

/// Objective of the program, fixed for all nodes.
struct Objective {
    P: CscMatrix<f64>,
    q: Vec<f64>,
}

fn objective(prog: &MathematicalProgram) -> Objective {
    let n = prog.num_vars();
    let mut P = Triplets::default();
    let mut q = vec![0.0; n];
    for expression in prog.linear_costs() {
        for (v, c) in expression.terms() {
            q[v.index()] += c;
        }
    }
    for cost in prog.quadratic_costs() {
        for (a, va) in cost.variables.iter().enumerate() {
            q[va.index()] += cost.b[a];
            for (b, vb) in cost.variables.iter().enumerate() {
                if va.index() <= vb.index() {
                    P.add(va.index(), vb.index(), cost.Q[(a, b)]);
                }
            }
        }
    }
    Objective { P: P.into_csc(n, n), q }
}

enum Relaxation {
    Solved { x: DVector<f64>, cost: f64 },
    Infeasible,
    Unbounded,
    Failed(SolverStatus),
}

fn solve_relaxation(
    prog: &MathematicalProgram,
    objective: &Objective,
    lower: &[f64],
    upper: &[f64],
    settings: &DefaultSettings<f64>,
) -> IkResult<Relaxation> {
    let n = prog.num_vars();
    let mut zero = RowBlock::default();
    let mut nonnegative = RowBlock::default();
    for c in prog.linear_constraints() {
        if c.is_equality() {
            zero.push(&c.expression, 1.0, c.lower);
            continue;
        }
        if c.upper.is_finite() {
            nonnegative.push(&c.expression, -1.0, c.upper);
        }
        if c.lower.is_finite() {
            nonnegative.push(&c.expression, 1.0, c.lower);
        }
    }
    for i in 0..n {
        let x_i = LinearExpression::from(Variable::from_index(i));
        if lower[i] == upper[i] {
            zero.push(&x_i, 1.0, lower[i]);
            continue;
        }
        if upper[i].is_finite() {
            nonnegative.push(&x_i, -1.0, upper[i]);
        }
        if lower[i].is_finite() {
            nonnegative.push(&x_i, 1.0, lower[i]);
        }
    }

    // Stack the blocks: zero, nonnegative, then the second order cones.
    let mut A = Triplets::default();
    let mut b = Vec::new();
    let mut cones: Vec<SupportedConeT<f64>> = Vec::new();
    fn append(block: RowBlock, A: &mut Triplets, b: &mut Vec<f64>) {
        let offset = b.len();
        for ((r, c), v) in block.A.entries {
            A.add(offset + r, c, v);
        }
        b.extend(block.b);
    }
    if zero.len() > 0 {
        cones.push(ZeroConeT(zero.len()));
        append(zero, &mut A, &mut b);
    }
    if nonnegative.len() > 0 {
        cones.push(NonnegativeConeT(nonnegative.len()));
        append(nonnegative, &mut A, &mut b);
    }
    for cone in prog.lorentz_cone_constraints() {
        // s_k = expression_k(x) in the cone
        let mut block = RowBlock::default();
        for expression in &cone.expressions {
            block.push(expression, 1.0, 0.0);
        }
        cones.push(SecondOrderConeT(block.len()));
        append(block, &mut A, &mut b);
    }
    let m = b.len();
    let A = A.into_csc(m, n);

    let mut solver = DefaultSolver::new(&objective.P, &objective.q, &A, &b, &cones, settings.clone());
    solver.solve();
    let status = solver.solution.status;
    Ok(match status {
        SolverStatus::Solved | SolverStatus::AlmostSolved => {
            let x = DVector::from_vec(solver.solution.x.clone());
            let cost = prog.evaluate_cost(&x)?;
            Relaxation::Solved { x, cost }
        }
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => Relaxation::Infeasible,
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => Relaxation::Unbounded,
        other => Relaxation::Failed(other),
    })
}

/// Open node of the search tree, ordered so that `BinaryHeap` pops the lowest bound first, then
/// the deepest node, then the child agreeing with the initial guess.
struct Node {
    bound: OrderedFloat<f64>,
    depth: usize,
    preferred: bool,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Node {
    fn key(&self) -> (std::cmp::Reverse<OrderedFloat<f64>>, usize, bool) {
        (std::cmp::Reverse(self.bound), self.depth, self.preferred)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Fixes every binary at `values` rounded into the node bounds and solves the remaining continuous
/// program. The point is returned only if it satisfies all constraints within `tolerance`.
fn fixed_binary_solution(
    prog: &MathematicalProgram,
    objective: &Objective,
    node: &Node,
    values: &DVector<f64>,
    binaries: &[Variable],
    settings: &DefaultSettings<f64>,
    tolerance: f64,
) -> IkResult<Option<(DVector<f64>, f64)>> {
    let mut lower = node.lower.clone();
    let mut upper = node.upper.clone();
    for v in binaries {
        let i = v.index();
        let value = values[i].round().clamp(lower[i], upper[i]);
        lower[i] = value;
        upper[i] = value;
    }
    let mut x = match solve_relaxation(prog, objective, &lower, &upper, settings)? {
        Relaxation::Solved { x, .. } => x,
        _ => return Ok(None),
    };
    for v in binaries {
        x[v.index()] = lower[v.index()];
    }
    let violation = prog.max_violation(&x)?;
    if violation > tolerance {
        trace!("Fixed binaries leave a violation of {}", violation);
        return Ok(None);
    }
    let cost = prog.evaluate_cost(&x)?;
    Ok(Some((x, cost)))
}

/// Replaces the incumbent if `candidate` is cheaper.
fn improve(incumbent: &mut Option<(DVector<f64>, f64)>, candidate: (DVector<f64>, f64), node: usize) {
    if incumbent.as_ref().map_or(true, |(_, best)| candidate.1 < *best) {
        debug!("New incumbent {} at node {}", candidate.1, node);
        *incumbent = Some(candidate);
    }
}

/// Binary with the largest distance from integrality, if any is above the tolerance.
fn most_fractional(x: &DVector<f64>, binaries: &[Variable], tolerance: f64) -> Option<Variable> {
    binaries
        .iter()
        .map(|v| (*v, (x[v.index()] - x[v.index()].round()).abs()))
        .filter(|(_, f)| *f > tolerance)
        .max_by_key(|(_, f)| OrderedFloat(*f))
        .map(|(v, _)| v)
}

pub(crate) fn solve_branch_and_bound(prog: &MathematicalProgram, options: &SolverOptions) -> IkResult<MathematicalProgramResult> {
    let start = Instant::now();
    let settings: DefaultSettings<f64> = DefaultSettingsBuilder::default()
        .verbose(false)
        .max_iter(options.conic_max_iterations)
        .time_limit(options.max_duration_ms as f64 / 1000.0)
        .build()
        .map_err(|e| IkError::Solver(format!("{}", e)))?;
    let objective = objective(prog);
    let binaries = prog.binary_variables();
    let guess = prog.initial_guess();
    let time_limit = Duration::from_millis(options.max_duration_ms);
    debug!("Branch and bound: {} variables, {} binaries, {} Lorentz cones",
        prog.num_vars(), binaries.len(), prog.lorentz_cone_constraints().len());

    let feasibility = options.feasibility_tolerance.max(options.integrality_tolerance);
    let root = Node {
        bound: OrderedFloat(f64::NEG_INFINITY),
        depth: 0,
        preferred: true,
        lower: prog.lower_bounds().iter().copied().collect(),
        upper: prog.upper_bounds().iter().copied().collect(),
    };

    let mut incumbent: Option<(DVector<f64>, f64)> = None;
    if !binaries.is_empty() && binaries.iter().all(|v| guess[v.index()].is_finite()) {
        if let Some(candidate) = fixed_binary_solution(prog, &objective, &root, &guess, &binaries, &settings, feasibility)? {
            improve(&mut incumbent, candidate, 0);
        }
    }

    // Depth first until the first incumbent, best first afterwards.
    let mut dive = Vec::new();
    let mut open = BinaryHeap::new();
    if incumbent.is_none() {
        dive.push(root);
    } else {
        open.push(root);
    }
    let mut explored = 0;
    let mut failed_nodes = 0;
    let mut unbounded = false;
    let mut limited = false;

    let prune_level = |incumbent: &Option<(DVector<f64>, f64)>| match incumbent {
        Some((_, cost)) => cost - options.absolute_gap.max(options.relative_gap * cost.abs()),
        None => f64::INFINITY,
    };

    while let Some(node) = dive.pop().or_else(|| open.pop()) {
        if node.bound.0 >= prune_level(&incumbent) {
            continue;
        }
        if explored >= options.max_nodes || start.elapsed() > time_limit {
            limited = true;
            break;
        }
        explored += 1;

        let (x, cost) = match solve_relaxation(prog, &objective, &node.lower, &node.upper, &settings)? {
            Relaxation::Solved { x, cost } => (x, cost),
            Relaxation::Infeasible => {
                trace!("Node {} at depth {} infeasible", explored, node.depth);
                continue;
            }
            Relaxation::Unbounded => {
                unbounded = true;
                break;
            }
            Relaxation::Failed(status) => {
                warn!("Relaxation at depth {} failed with {:?}", node.depth, status);
                failed_nodes += 1;
                continue;
            }
        };
        trace!("Node {} at depth {}: relaxation cost {}", explored, node.depth, cost);
        if cost >= prune_level(&incumbent) {
            continue;
        }

        match most_fractional(&x, &binaries, options.integrality_tolerance) {
            None => {
                let mut rounded = x.clone();
                for v in &binaries {
                    rounded[v.index()] = rounded[v.index()].round();
                }
                if prog.max_violation(&rounded)? <= feasibility {
                    let cost = prog.evaluate_cost(&rounded)?;
                    improve(&mut incumbent, (rounded, cost), explored);
                } else if let Some(candidate) =
                    fixed_binary_solution(prog, &objective, &node, &x, &binaries, &settings, feasibility)?
                {
                    improve(&mut incumbent, candidate, explored);
                }
            }
            Some(branch) => {
                if incumbent.is_none() {
                    if let Some(candidate) =
                        fixed_binary_solution(prog, &objective, &node, &x, &binaries, &settings, feasibility)?
                    {
                        improve(&mut incumbent, candidate, explored);
                    }
                }
                let i = branch.index();
                let hint = if guess[i].is_finite() { guess[i] } else { x[i] };
                let preferred_value = if hint >= 0.5 { 1.0 } else { 0.0 };
                // The preferred child goes last so the dive pops it first.
                for value in [1.0 - preferred_value, preferred_value] {
                    let mut lower = node.lower.clone();
                    let mut upper = node.upper.clone();
                    lower[i] = value;
                    upper[i] = value;
                    let child = Node {
                        bound: OrderedFloat(cost),
                        depth: node.depth + 1,
                        preferred: value == preferred_value,
                        lower,
                        upper,
                    };
                    if incumbent.is_none() {
                        dive.push(child);
                    } else {
                        open.push(child);
                    }
                }
            }
        }
        if incumbent.is_some() && !dive.is_empty() {
            open.extend(dive.drain(..));
        }
    }

    let (x, optimal_cost, status) = match incumbent {
        Some((x, cost)) => {
            let status = if limited { SolutionResult::IterationLimit } else { SolutionResult::SolutionFound };
            (x, cost, status)
        }
        None => {
            let status = if unbounded {
                SolutionResult::Unbounded
            } else if limited {
                SolutionResult::IterationLimit
            } else if failed_nodes > 0 {
                SolutionResult::SolverSpecificError
            } else {
                SolutionResult::InfeasibleConstraints
            };
            let x = guess.map(|v| if v.is_finite() { v } else { 0.0 });
            let cost = if unbounded { f64::NEG_INFINITY } else { f64::INFINITY };
            (x, cost, status)
        }
    };
    info!("Branch and bound finished: {} with cost {} after {} nodes in {:?}",
        status, optimal_cost, explored, start.elapsed());
    Ok(MathematicalProgramResult {
        x,
        optimal_cost,
        status,
        solver: SolverId::BranchAndBound,
        iterations: explored,
        solve_time: start.elapsed(),
    })
}
