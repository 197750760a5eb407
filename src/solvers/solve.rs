//! Backend selection for [`MathematicalProgram`].

use tracing::debug;

use crate::error::{IkError, IkResult};
pub use crate::mathematical_program::{Binding, LinearExpression, MathematicalProgram, Variable, VariableType};
pub use crate::solution_result::{MathematicalProgramResult, SolutionResult, SolverId};
pub use crate::solver_options::SolverOptions;

use crate::branch_and_bound::solve_branch_and_bound;
use crate::nonlinear_solver::solve_nonlinear;

/// Backend that can handle the program, or why none can.
pub fn choose_solver(prog: &MathematicalProgram) -> IkResult<SolverId> {
    let mixed_integer_or_conic = prog.has_binaries() || prog.has_conic_constraints();
    match (prog.is_nonlinear(), mixed_integer_or_conic) {
        (true, true) => Err(IkError::UnsupportedProgram(
            "kinematic constraints or costs cannot be combined with binary variables or Lorentz cones"
                .to_string(),
        )),
        (_, true) => Ok(SolverId::BranchAndBound),
        (_, false) if !prog.quadratic_costs().is_empty() || prog.is_nonlinear() => Ok(SolverId::AugmentedLagrangian),
        // Linear programs go to the conic backend, it gives exact vertices.
        (_, false) => Ok(SolverId::BranchAndBound),
    }
}

/// Solves `prog` with the backend picked by [`choose_solver`].
/// Infeasibility and iteration limits are reported in the result status, not as errors.
pub fn solve(prog: &MathematicalProgram, options: &SolverOptions) -> IkResult<MathematicalProgramResult> {
    let solver = choose_solver(prog)?;
    debug!("Solving a program with {} variables using {:?}", prog.num_vars(), solver);
    match solver {
        SolverId::AugmentedLagrangian => solve_nonlinear(prog, options),
        SolverId::BranchAndBound => solve_branch_and_bound(prog, options),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_quaternion_constraint::UnitQuaternionConstraint;
    use nalgebra::DVector;

    #[test]
    fn test_mixed_program_rejected() {
        let mut prog = MathematicalProgram::new();
        let q = prog.new_continuous_variables(4, "q");
        prog.add_constraint(UnitQuaternionConstraint::new(), &q).unwrap();
        prog.new_binary_variables(1, "z");
        assert!(matches!(solve(&prog, &SolverOptions::default()), Err(IkError::UnsupportedProgram(_))));
    }

    #[test]
    fn test_unit_quaternion_projection() {
        // Closest unit quaternion to (2, 0, 0, 0) in the least squares sense is (1, 0, 0, 0).
        let mut prog = MathematicalProgram::new();
        let q = prog.new_continuous_variables(4, "q");
        prog.add_constraint(UnitQuaternionConstraint::new(), &q).unwrap();
        let target = DVector::from_vec(vec![2.0, 0.0, 0.0, 0.0]);
        prog.add_quadratic_cost(&(nalgebra::DMatrix::identity(4, 4) * 2.0), &(-2.0 * &target), 4.0, &q).unwrap();
        prog.set_initial_guess(&q, &DVector::from_vec(vec![0.5, 0.5, 0.5, 0.5])).unwrap();
        assert_eq!(choose_solver(&prog).unwrap(), SolverId::AugmentedLagrangian);
        let options = SolverOptions { feasibility_tolerance: 1e-5, ..SolverOptions::default() };
        let result = solve(&prog, &options).unwrap();
        assert!(result.is_success(), "{}", result);
        let solution = result.get_solutions(&q);
        assert!((solution.norm() - 1.0).abs() < 1e-4);
        assert!((solution[0] - 1.0).abs() < 1e-3);
    }
}
