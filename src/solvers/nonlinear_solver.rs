//! Nonlinear backend: augmented Lagrangian (ALM) with the PANOC inner solver from optimization_engine.
//!
//! All constraint rows (linear and kinematic) are stacked into `F1(u)` and required to lie in the box
//! `C = [lb, ub]`. Variable bounds become the simple set `U` that PANOC projects onto. Programs without
//! constraint rows go to PANOC directly.
//!
//! PANOC measures convergence on the step scaled by its own step size, which shrinks as the penalty
//! grows, so ALM can stop a little outside tight equality constraints. Such points get a projected
//! damped Gauss-Newton pass on the constraint residual before the feasibility check.

use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use optimization_engine::alm::{AlmCache, AlmFactory, AlmOptimizer, AlmProblem, NO_JACOBIAN_MAPPING, NO_MAPPING};
use optimization_engine::constraints::{Ball2, Rectangle};
use optimization_engine::core::ExitStatus;
use optimization_engine::panoc::{PANOCCache, PANOCOptimizer};
use optimization_engine::{Optimizer, Problem, SolverError};
use tracing::{debug, trace, warn};

use crate::constraints::Constraint;
use crate::costs::Cost;
use crate::error::{IkError, IkResult};
use crate::jacobian::damped_least_squares;
use crate::mathematical_program::{gather, MathematicalProgram};
use crate::solution_result::{MathematicalProgramResult, SolutionResult, SolverId};
use crate::solver_options::SolverOptions;

/// Multipliers are searched in a large ball, OpEn requires a compact set.
const MULTIPLIER_RADIUS: f64 = 1e12;

const RESTORATION_INITIAL_DAMPING: f64 = 1e-6;

/// Row layout of `F1`: linear constraints first, then the generic ones in program order.
struct ConstraintRows {
    lower: Vec<f64>,
    upper: Vec<f64>,
    generic_offsets: Vec<usize>,
}

impl ConstraintRows {
    fn new(prog: &MathematicalProgram) -> Self {
        let mut lower = Vec::new();
        let mut upper = Vec::new();
        for c in prog.linear_constraints() {
            lower.push(c.lower);
            upper.push(c.upper);
        }
        let mut generic_offsets = Vec::with_capacity(prog.generic_constraints().len());
        for (c, _) in prog.generic_constraints() {
            generic_offsets.push(lower.len());
            lower.extend(c.lower_bound().iter());
            upper.extend(c.upper_bound().iter());
        }
        ConstraintRows { lower, upper, generic_offsets }
    }

    fn len(&self) -> usize {
        self.lower.len()
    }
}

fn solver_error(e: IkError) -> SolverError {
    warn!("Evaluation failed inside the solver: {}", e);
    SolverError::Cost
}

fn cost_value(prog: &MathematicalProgram, u: &[f64]) -> IkResult<f64> {
    prog.evaluate_cost(&DVector::from_column_slice(u))
}

fn cost_gradient(prog: &MathematicalProgram, u: &[f64], grad: &mut [f64]) -> IkResult<()> {
    let x = DVector::from_column_slice(u);
    grad.iter_mut().for_each(|g| *g = 0.0);
    for expression in prog.linear_costs() {
        for (v, c) in expression.terms() {
            grad[v.index()] += c;
        }
    }
    for cost in prog.quadratic_costs() {
        let xs = gather(&x, &cost.variables);
        let g = &cost.Q * xs + &cost.b;
        for (k, v) in cost.variables.iter().enumerate() {
            grad[v.index()] += g[k];
        }
    }
    for (cost, variables) in prog.generic_costs() {
        let (_, g) = cost.eval_with_gradient(&gather(&x, variables))?;
        for (k, v) in variables.iter().enumerate() {
            grad[v.index()] += g[k];
        }
    }
    Ok(())
}

fn constraint_values(prog: &MathematicalProgram, rows: &ConstraintRows, u: &[f64], out: &mut [f64]) -> IkResult<()> {
    let x = DVector::from_column_slice(u);
    for (i, c) in prog.linear_constraints().iter().enumerate() {
        out[i] = c.expression.evaluate(&x);
    }
    for ((c, variables), offset) in prog.generic_constraints().iter().zip(&rows.generic_offsets) {
        let r = c.eval_values(&gather(&x, variables))?;
        out[*offset..*offset + r.len()].copy_from_slice(r.as_slice());
    }
    Ok(())
}

/// `res = J(u)ᵀ d` for the stacked constraint rows.
fn constraint_jacobian_transpose(
    prog: &MathematicalProgram,
    rows: &ConstraintRows,
    u: &[f64],
    d: &[f64],
    res: &mut [f64],
) -> IkResult<()> {
    let x = DVector::from_column_slice(u);
    res.iter_mut().for_each(|r| *r = 0.0);
    for (i, c) in prog.linear_constraints().iter().enumerate() {
        for (v, coefficient) in c.expression.terms() {
            res[v.index()] += coefficient * d[i];
        }
    }
    for ((c, variables), offset) in prog.generic_constraints().iter().zip(&rows.generic_offsets) {
        let (_, J) = c.eval_with_gradient(&gather(&x, variables))?;
        let d_c = DVector::from_column_slice(&d[*offset..*offset + J.nrows()]);
        let g = J.transpose() * d_c;
        for (k, v) in variables.iter().enumerate() {
            res[v.index()] += g[k];
        }
    }
    Ok(())
}

/// Starting point: the initial guess with missing entries set to zero, projected into the bounds.
fn starting_point(prog: &MathematicalProgram) -> Vec<f64> {
    let lower = prog.lower_bounds();
    let upper = prog.upper_bounds();
    prog.initial_guess()
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let v = if v.is_finite() { *v } else { 0.0 };
            v.max(lower[i]).min(upper[i])
        })
        .collect()
}

/// Distance of the stacked constraint rows to their bounds at `x`, with the Jacobian. Rows strictly
/// inside their bounds get a zero Jacobian row so they don't hold the step back.
fn constraint_residual(prog: &MathematicalProgram, rows: &ConstraintRows, x: &DVector<f64>) -> IkResult<(DVector<f64>, DMatrix<f64>)> {
    let mut values = DVector::zeros(rows.len());
    let mut J = DMatrix::zeros(rows.len(), x.len());
    for (i, c) in prog.linear_constraints().iter().enumerate() {
        values[i] = c.expression.evaluate(x);
        for (v, coefficient) in c.expression.terms() {
            J[(i, v.index())] += coefficient;
        }
    }
    for ((c, variables), offset) in prog.generic_constraints().iter().zip(&rows.generic_offsets) {
        let (r, J_c) = c.eval_with_gradient(&gather(x, variables))?;
        for k in 0..r.len() {
            values[offset + k] = r[k];
            for (column, v) in variables.iter().enumerate() {
                J[(offset + k, v.index())] += J_c[(k, column)];
            }
        }
    }
    let mut residual = DVector::zeros(rows.len());
    for i in 0..rows.len() {
        let (lower, upper) = (rows.lower[i], rows.upper[i]);
        if values[i] > lower && values[i] < upper {
            J.row_mut(i).fill(0.0);
        } else {
            residual[i] = values[i] - values[i].max(lower).min(upper);
        }
    }
    Ok((residual, J))
}

/// Moves `x` onto the constraint rows by damped Gauss-Newton steps projected into the variable
/// bounds, ignoring the cost. Returns the number of steps taken.
fn restore_feasibility(
    prog: &MathematicalProgram,
    rows: &ConstraintRows,
    x: &mut DVector<f64>,
    options: &SolverOptions,
) -> IkResult<usize> {
    let lower = prog.lower_bounds();
    let upper = prog.upper_bounds();
    let target = 0.1 * options.feasibility_tolerance;
    let (mut residual, mut J) = constraint_residual(prog, rows, x)?;
    let mut damping = RESTORATION_INITIAL_DAMPING;
    let mut steps = 0;
    while steps < options.max_restoration_iterations {
        if !(residual.amax() > target) {
            break;
        }
        steps += 1;
        let step = match damped_least_squares(&J, &(-&residual), damping) {
            Ok(step) => step,
            Err(e) => {
                debug!("Feasibility restoration stopped: {}", e);
                break;
            }
        };
        if step.norm() < 1e-12 {
            break;
        }
        let mut candidate = &*x + step;
        for i in 0..candidate.len() {
            candidate[i] = candidate[i].max(lower[i]).min(upper[i]);
        }
        let (candidate_residual, candidate_J) = constraint_residual(prog, rows, &candidate)?;
        if candidate_residual.norm_squared() < residual.norm_squared() {
            *x = candidate;
            residual = candidate_residual;
            J = candidate_J;
            damping = (damping * 0.5).max(1e-12);
        } else {
            damping *= 10.0;
            if damping > 1e6 {
                debug!("Feasibility restoration stalled at residual {} after {} steps", residual.amax(), steps);
                break;
            }
        }
    }
    trace!("Feasibility restoration: residual {} after {} steps", residual.amax(), steps);
    Ok(steps)
}

struct RunSummary {
    exit_status: ExitStatus,
    iterations: usize,
}

pub(crate) fn solve_nonlinear(prog: &MathematicalProgram, options: &SolverOptions) -> IkResult<MathematicalProgramResult> {
    let start = Instant::now();
    let n = prog.num_vars();
    let mut u = starting_point(prog);
    if n == 0 {
        let x = DVector::zeros(0);
        let feasible = prog.check_satisfied(&x, options.feasibility_tolerance)?;
        return Ok(MathematicalProgramResult {
            optimal_cost: prog.evaluate_cost(&x)?,
            x,
            status: if feasible { SolutionResult::SolutionFound } else { SolutionResult::InfeasibleConstraints },
            solver: SolverId::AugmentedLagrangian,
            iterations: 0,
            solve_time: start.elapsed(),
        });
    }

    if !(options.penalty_update_factor > 1.0) {
        return Err(IkError::InvalidArgument(format!(
            "Penalty update factor must exceed 1, got {}", options.penalty_update_factor)));
    }
    let rows = ConstraintRows::new(prog);
    let lower = prog.lower_bounds();
    let upper = prog.upper_bounds();
    let max_duration = Duration::from_millis(options.max_duration_ms);
    debug!("ALM setup: {} variables, {} constraint rows", n, rows.len());

    let f = |u: &[f64], cost: &mut f64| -> Result<(), SolverError> {
        *cost = cost_value(prog, u).map_err(solver_error)?;
        Ok(())
    };
    let df = |u: &[f64], grad: &mut [f64]| -> Result<(), SolverError> {
        cost_gradient(prog, u, grad).map_err(solver_error)
    };

    let outcome = if rows.len() == 0 {
        let bounds = Rectangle::new(Some(lower.as_slice()), Some(upper.as_slice()));
        let mut cache = PANOCCache::new(n, options.tolerance, options.lbfgs_memory);
        let problem = Problem::new(&bounds, df, f);
        let mut panoc = PANOCOptimizer::new(problem, &mut cache)
            .with_max_iter(options.max_inner_iterations)
            .with_max_duration(max_duration);
        panoc.solve(&mut u).map(|status| RunSummary {
            exit_status: status.exit_status(),
            iterations: status.iterations(),
        })
    } else {
        let n1 = rows.len();
        let f1 = |u: &[f64], f1u: &mut [f64]| -> Result<(), SolverError> {
            constraint_values(prog, &rows, u, f1u).map_err(solver_error)
        };
        let jf1t = |u: &[f64], d: &[f64], res: &mut [f64]| -> Result<(), SolverError> {
            constraint_jacobian_transpose(prog, &rows, u, d, res).map_err(solver_error)
        };
        let set_c = Rectangle::new(Some(rows.lower.as_slice()), Some(rows.upper.as_slice()));
        let factory = AlmFactory::new(f, df, Some(f1), Some(jf1t), NO_MAPPING, NO_JACOBIAN_MAPPING, Some(set_c), 0);

        let bounds = Rectangle::new(Some(lower.as_slice()), Some(upper.as_slice()));
        let alm_set_c = Rectangle::new(Some(rows.lower.as_slice()), Some(rows.upper.as_slice()));
        let alm_set_y = Ball2::new(None, MULTIPLIER_RADIUS);
        let problem = AlmProblem::new(
            bounds,
            Some(alm_set_c),
            Some(alm_set_y),
            |u: &[f64], xi: &[f64], cost: &mut f64| -> Result<(), SolverError> { factory.psi(u, xi, cost) },
            |u: &[f64], xi: &[f64], grad: &mut [f64]| -> Result<(), SolverError> { factory.d_psi(u, xi, grad) },
            Some(f1),
            NO_MAPPING,
            n1,
            0,
        );

        let panoc_cache = PANOCCache::new(n, options.tolerance, options.lbfgs_memory);
        let mut cache = AlmCache::new(panoc_cache, n1, 0);
        let mut optimizer = AlmOptimizer::new(&mut cache, problem)
            .with_delta_tolerance(options.feasibility_tolerance)
            .with_epsilon_tolerance(options.tolerance)
            .with_initial_inner_tolerance(options.initial_tolerance.max(options.tolerance))
            .with_initial_penalty(options.initial_penalty)
            .with_penalty_update_factor(options.penalty_update_factor)
            .with_max_outer_iterations(options.max_outer_iterations)
            .with_max_inner_iterations(options.max_inner_iterations)
            .with_max_duration(max_duration);
        optimizer.solve(&mut u).map(|status| RunSummary {
            exit_status: status.exit_status(),
            iterations: status.num_inner_iterations(),
        })
    };

    let mut x = DVector::from_vec(u);
    let (status, iterations) = match outcome {
        Ok(run) => {
            let mut violation = prog.max_violation(&x)?;
            let mut iterations = run.iterations;
            if violation > options.feasibility_tolerance && violation.is_finite() && rows.len() > 0 {
                debug!("ALM stopped at violation {}, restoring feasibility", violation);
                iterations += restore_feasibility(prog, &rows, &mut x, options)?;
                violation = prog.max_violation(&x)?;
            }
            (classify(run.exit_status, violation, options.feasibility_tolerance), iterations)
        }
        Err(e) => {
            warn!("Nonlinear solver failed: {:?}", e);
            (SolutionResult::SolverSpecificError, 0)
        }
    };
    let optimal_cost = prog.evaluate_cost(&x).unwrap_or(f64::NAN);
    debug!("ALM finished: {} after {} inner iterations", status, iterations);
    Ok(MathematicalProgramResult {
        x,
        optimal_cost,
        status,
        solver: SolverId::AugmentedLagrangian,
        iterations,
        solve_time: start.elapsed(),
    })
}

/// A run that stopped on a limit but is feasible counts as a solution: local IK cares about
/// feasibility first, the cost is a preference.
fn classify(exit_status: ExitStatus, violation: f64, tolerance: f64) -> SolutionResult {
    let feasible = violation <= tolerance;
    match (exit_status, feasible) {
        (_, true) => SolutionResult::SolutionFound,
        (ExitStatus::Converged, false) => SolutionResult::InfeasibleConstraints,
        (_, false) => SolutionResult::IterationLimit,
    }
}
