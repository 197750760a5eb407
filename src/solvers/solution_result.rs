//! Outcome of a solver run.

use std::fmt;
use std::time::Duration;

use nalgebra::DVector;

use crate::mathematical_program::Variable;

/// How the solver finished. Not an error: infeasible and limited runs are regular outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolutionResult {
    SolutionFound,
    InfeasibleConstraints,
    Unbounded,
    IterationLimit,
    SolverSpecificError,
}

/// Backend that produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverId {
    /// Augmented Lagrangian with PANOC inner solver (optimization_engine).
    AugmentedLagrangian,
    /// Branch and bound over binaries with Clarabel relaxations.
    BranchAndBound,
}

impl fmt::Display for SolutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SolutionResult::SolutionFound => "solution found",
            SolutionResult::InfeasibleConstraints => "infeasible constraints",
            SolutionResult::Unbounded => "unbounded",
            SolutionResult::IterationLimit => "iteration limit",
            SolutionResult::SolverSpecificError => "solver specific error",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug)]
pub struct MathematicalProgramResult {
    /// Values of all decision variables, in program order.
    pub x: DVector<f64>,
    pub optimal_cost: f64,
    pub status: SolutionResult,
    pub solver: SolverId,
    /// Inner iterations for the nonlinear backend, explored nodes for branch and bound.
    pub iterations: usize,
    pub solve_time: Duration,
}

impl MathematicalProgramResult {
    pub fn is_success(&self) -> bool {
        self.status == SolutionResult::SolutionFound
    }

    pub fn get_solution(&self, variable: Variable) -> f64 {
        self.x[variable.index()]
    }

    pub fn get_solutions(&self, variables: &[Variable]) -> DVector<f64> {
        DVector::from_iterator(variables.len(), variables.iter().map(|v| self.x[v.index()]))
    }
}

impl fmt::Display for MathematicalProgramResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}, cost {:.6}, {} iterations in {:?}",
               self.solver, self.status, self.optimal_cost, self.iterations, self.solve_time)
    }
}
