//! Optimization problem container: decision variables, their bounds, constraints and costs.
//!
//! Linear and conic terms are kept in explicit form so that a conic backend can consume them,
//! kinematic terms are kept as [`IkConstraint`] / [`IkCost`] bound to a variable list.

use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Mul, Neg, Sub};

use nalgebra::{DMatrix, DVector};

use crate::constraints::{Constraint, ConstraintVariant, IkConstraint};
use crate::costs::{Cost, CostVariant, IkCost};
use crate::error::{check_dimension, IkError, IkResult};

/// Handle to one decision variable of a [`MathematicalProgram`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Variable(usize);

impl Variable {
    pub fn index(&self) -> usize {
        self.0
    }

    /// Variables are dense indices into their program.
    pub(crate) fn from_index(index: usize) -> Variable {
        Variable(index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariableType {
    Continuous,
    Binary,
}

/// `Σ coefficient * variable + constant`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinearExpression {
    terms: Vec<(Variable, f64)>,
    constant: f64,
}

impl LinearExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        LinearExpression { terms: Vec::new(), constant: value }
    }

    /// Weighted sum of variables.
    pub fn sum(terms: impl IntoIterator<Item = (Variable, f64)>) -> Self {
        LinearExpression { terms: terms.into_iter().collect(), constant: 0.0 }
    }

    pub fn term(mut self, variable: Variable, coefficient: f64) -> Self {
        self.add_term(variable, coefficient);
        self
    }

    pub fn add_term(&mut self, variable: Variable, coefficient: f64) {
        if coefficient != 0.0 {
            self.terms.push((variable, coefficient));
        }
    }

    pub fn add_constant(&mut self, value: f64) {
        self.constant += value;
    }

    pub fn terms(&self) -> &[(Variable, f64)] {
        &self.terms
    }

    pub fn constant_term(&self) -> f64 {
        self.constant
    }

    pub fn evaluate(&self, x: &DVector<f64>) -> f64 {
        self.terms.iter().fold(self.constant, |sum, (v, c)| sum + c * x[v.0])
    }
}

impl From<Variable> for LinearExpression {
    fn from(variable: Variable) -> Self {
        LinearExpression::new().term(variable, 1.0)
    }
}

impl Add for LinearExpression {
    type Output = LinearExpression;

    fn add(mut self, rhs: LinearExpression) -> LinearExpression {
        self.terms.extend(rhs.terms);
        self.constant += rhs.constant;
        self
    }
}

impl Sub for LinearExpression {
    type Output = LinearExpression;

    fn sub(self, rhs: LinearExpression) -> LinearExpression {
        self + (-rhs)
    }
}

impl Neg for LinearExpression {
    type Output = LinearExpression;

    fn neg(self) -> LinearExpression {
        self * -1.0
    }
}

impl Mul<f64> for LinearExpression {
    type Output = LinearExpression;

    fn mul(mut self, factor: f64) -> LinearExpression {
        for (_, c) in self.terms.iter_mut() {
            *c *= factor;
        }
        self.constant *= factor;
        self
    }
}

/// Typed handle to a constraint or cost added to a program, with the variables it is bound to.
pub struct Binding<C> {
    index: usize,
    variables: Vec<Variable>,
    _marker: PhantomData<fn() -> C>,
}

impl<C> Binding<C> {
    fn new(index: usize, variables: Vec<Variable>) -> Self {
        Binding { index, variables, _marker: PhantomData }
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }
}

impl<C> Clone for Binding<C> {
    fn clone(&self) -> Self {
        Binding::new(self.index, self.variables.clone())
    }
}

impl<C> fmt::Debug for Binding<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("index", &self.index).field("variables", &self.variables).finish()
    }
}

#[derive(Clone, Debug)]
pub struct LinearConstraint {
    pub expression: LinearExpression,
    pub lower: f64,
    pub upper: f64,
}

impl LinearConstraint {
    pub fn is_equality(&self) -> bool {
        self.lower == self.upper
    }
}

/// `expressions[0] >= |expressions[1..]|`.
#[derive(Clone, Debug)]
pub struct LorentzConeConstraint {
    pub expressions: Vec<LinearExpression>,
}

/// `½ xᵀQx + bᵀx + c` over `variables`.
#[derive(Clone, Debug)]
pub struct QuadraticCost {
    pub Q: DMatrix<f64>,
    pub b: DVector<f64>,
    pub c: f64,
    pub variables: Vec<Variable>,
}

#[derive(Clone, Debug, Default)]
pub struct MathematicalProgram {
    names: Vec<String>,
    types: Vec<VariableType>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    initial_guess: Vec<f64>,
    linear_constraints: Vec<LinearConstraint>,
    lorentz_cones: Vec<LorentzConeConstraint>,
    generic_constraints: Vec<(IkConstraint, Vec<Variable>)>,
    linear_costs: Vec<LinearExpression>,
    quadratic_costs: Vec<QuadraticCost>,
    generic_costs: Vec<(IkCost, Vec<Variable>)>,
}

impl MathematicalProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_vars(&self) -> usize {
        self.types.len()
    }

    fn new_variables(&mut self, n: usize, name: &str, variable_type: VariableType) -> Vec<Variable> {
        let (lower, upper) = match variable_type {
            VariableType::Continuous => (f64::NEG_INFINITY, f64::INFINITY),
            VariableType::Binary => (0.0, 1.0),
        };
        (0..n)
            .map(|i| {
                let variable = Variable(self.types.len());
                self.names.push(if n == 1 { name.to_string() } else { format!("{}({})", name, i) });
                self.types.push(variable_type);
                self.lower.push(lower);
                self.upper.push(upper);
                self.initial_guess.push(f64::NAN);
                variable
            })
            .collect()
    }

    pub fn new_continuous_variables(&mut self, n: usize, name: &str) -> Vec<Variable> {
        self.new_variables(n, name, VariableType::Continuous)
    }

    pub fn new_continuous_variable(&mut self, name: &str) -> Variable {
        self.new_variables(1, name, VariableType::Continuous)[0]
    }

    pub fn new_binary_variables(&mut self, n: usize, name: &str) -> Vec<Variable> {
        self.new_variables(n, name, VariableType::Binary)
    }

    pub fn variable_name(&self, variable: Variable) -> &str {
        &self.names[variable.0]
    }

    pub fn variable_type(&self, variable: Variable) -> VariableType {
        self.types[variable.0]
    }

    pub fn binary_variables(&self) -> Vec<Variable> {
        (0..self.num_vars()).filter(|i| self.types[*i] == VariableType::Binary).map(Variable).collect()
    }

    fn check_variables(&self, variables: &[Variable]) -> IkResult<()> {
        for v in variables {
            if v.0 >= self.num_vars() {
                return Err(IkError::InvalidArgument(format!("{:?} does not belong to this program", v)));
            }
        }
        Ok(())
    }

    fn check_expression(&self, expression: &LinearExpression) -> IkResult<()> {
        self.check_variables(&expression.terms.iter().map(|(v, _)| *v).collect::<Vec<_>>())?;
        if !expression.constant.is_finite() || expression.terms.iter().any(|(_, c)| !c.is_finite()) {
            return Err(IkError::InvalidArgument("Linear expression with non-finite coefficients".to_string()));
        }
        Ok(())
    }

    /// Intersects the bounds of `variables` with `[lower, upper]`.
    pub fn add_bounding_box_constraint(
        &mut self,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
        variables: &[Variable],
    ) -> IkResult<()> {
        check_dimension("bounding box lower bound", variables.len(), lower.len())?;
        check_dimension("bounding box upper bound", variables.len(), upper.len())?;
        self.check_variables(variables)?;
        for (i, v) in variables.iter().enumerate() {
            if lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i] {
                return Err(IkError::InvalidBounds {
                    what: format!("bounding box of {}", self.names[v.0]),
                    index: i,
                    lower: lower[i],
                    upper: upper[i],
                });
            }
        }
        for (i, v) in variables.iter().enumerate() {
            self.lower[v.0] = self.lower[v.0].max(lower[i]);
            self.upper[v.0] = self.upper[v.0].min(upper[i]);
        }
        Ok(())
    }

    pub fn lower_bounds(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.lower)
    }

    pub fn upper_bounds(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.upper)
    }

    /// `lower <= expression <= upper`. Returns the index of the constraint.
    pub fn add_linear_constraint(&mut self, expression: LinearExpression, lower: f64, upper: f64) -> IkResult<usize> {
        self.check_expression(&expression)?;
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(IkError::InvalidBounds { what: "linear constraint".to_string(), index: 0, lower, upper });
        }
        self.linear_constraints.push(LinearConstraint { expression, lower, upper });
        Ok(self.linear_constraints.len() - 1)
    }

    pub fn add_linear_equality_constraint(&mut self, expression: LinearExpression, value: f64) -> IkResult<usize> {
        self.add_linear_constraint(expression, value, value)
    }

    pub fn linear_constraints(&self) -> &[LinearConstraint] {
        &self.linear_constraints
    }

    /// `expressions[0] >= |expressions[1..]|`, at least two expressions.
    pub fn add_lorentz_cone_constraint(&mut self, expressions: Vec<LinearExpression>) -> IkResult<()> {
        if expressions.len() < 2 {
            return Err(IkError::InvalidArgument("A Lorentz cone needs at least two rows".to_string()));
        }
        for expression in &expressions {
            self.check_expression(expression)?;
        }
        self.lorentz_cones.push(LorentzConeConstraint { expressions });
        Ok(())
    }

    pub fn lorentz_cone_constraints(&self) -> &[LorentzConeConstraint] {
        &self.lorentz_cones
    }

    /// Binds `constraint` to `variables`, one per constraint input.
    pub fn add_constraint<C: ConstraintVariant>(&mut self, constraint: C, variables: &[Variable]) -> IkResult<Binding<C>> {
        check_dimension(constraint.description(), constraint.num_vars(), variables.len())?;
        self.check_variables(variables)?;
        self.generic_constraints.push((constraint.into_constraint(), variables.to_vec()));
        Ok(Binding::new(self.generic_constraints.len() - 1, variables.to_vec()))
    }

    pub fn constraint<C: ConstraintVariant>(&self, binding: &Binding<C>) -> IkResult<&C> {
        self.generic_constraints
            .get(binding.index)
            .and_then(|(c, _)| C::from_constraint(c))
            .ok_or_else(|| IkError::InvalidArgument(format!("{:?} does not belong to this program", binding)))
    }

    pub fn constraint_mut<C: ConstraintVariant>(&mut self, binding: &Binding<C>) -> IkResult<&mut C> {
        let description = format!("{:?} does not belong to this program", binding);
        self.generic_constraints
            .get_mut(binding.index)
            .and_then(|(c, _)| C::from_constraint_mut(c))
            .ok_or(IkError::InvalidArgument(description))
    }

    pub fn generic_constraints(&self) -> &[(IkConstraint, Vec<Variable>)] {
        &self.generic_constraints
    }

    pub fn add_linear_cost(&mut self, expression: LinearExpression) -> IkResult<()> {
        self.check_expression(&expression)?;
        self.linear_costs.push(expression);
        Ok(())
    }

    pub fn linear_costs(&self) -> &[LinearExpression] {
        &self.linear_costs
    }

    /// `½ xᵀQx + bᵀx + c`. `Q` is symmetrized and must be positive semidefinite for the conic backend.
    pub fn add_quadratic_cost(&mut self, Q: &DMatrix<f64>, b: &DVector<f64>, c: f64, variables: &[Variable]) -> IkResult<()> {
        check_dimension("quadratic cost Q rows", variables.len(), Q.nrows())?;
        check_dimension("quadratic cost Q columns", variables.len(), Q.ncols())?;
        check_dimension("quadratic cost b", variables.len(), b.len())?;
        self.check_variables(variables)?;
        let Q = (Q + Q.transpose()) * 0.5;
        self.quadratic_costs.push(QuadraticCost { Q, b: b.clone(), c, variables: variables.to_vec() });
        Ok(())
    }

    pub fn quadratic_costs(&self) -> &[QuadraticCost] {
        &self.quadratic_costs
    }

    pub fn add_cost<C: CostVariant>(&mut self, cost: C, variables: &[Variable]) -> IkResult<Binding<C>> {
        check_dimension(cost.description(), cost.num_vars(), variables.len())?;
        self.check_variables(variables)?;
        self.generic_costs.push((cost.into_cost(), variables.to_vec()));
        Ok(Binding::new(self.generic_costs.len() - 1, variables.to_vec()))
    }

    pub fn cost<C: CostVariant>(&self, binding: &Binding<C>) -> IkResult<&C> {
        self.generic_costs
            .get(binding.index)
            .and_then(|(c, _)| C::from_cost(c))
            .ok_or_else(|| IkError::InvalidArgument(format!("{:?} does not belong to this program", binding)))
    }

    pub fn generic_costs(&self) -> &[(IkCost, Vec<Variable>)] {
        &self.generic_costs
    }

    pub fn set_initial_guess(&mut self, variables: &[Variable], values: &DVector<f64>) -> IkResult<()> {
        check_dimension("initial guess", variables.len(), values.len())?;
        self.check_variables(variables)?;
        for (v, value) in variables.iter().zip(values.iter()) {
            self.initial_guess[v.0] = *value;
        }
        Ok(())
    }

    pub fn set_initial_guess_for(&mut self, variable: Variable, value: f64) -> IkResult<()> {
        self.check_variables(&[variable])?;
        self.initial_guess[variable.0] = value;
        Ok(())
    }

    /// Initial guess for all variables, NaN where none was given.
    pub fn initial_guess(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.initial_guess)
    }

    /// True if the program has kinematic (generic) constraints or costs.
    pub fn is_nonlinear(&self) -> bool {
        !self.generic_constraints.is_empty() || !self.generic_costs.is_empty()
    }

    pub fn has_binaries(&self) -> bool {
        self.types.contains(&VariableType::Binary)
    }

    pub fn has_conic_constraints(&self) -> bool {
        !self.lorentz_cones.is_empty()
    }

    /// Total cost at `x`.
    pub fn evaluate_cost(&self, x: &DVector<f64>) -> IkResult<f64> {
        check_dimension("decision variables", self.num_vars(), x.len())?;
        let mut total = 0.0;
        for expression in &self.linear_costs {
            total += expression.evaluate(x);
        }
        for cost in &self.quadratic_costs {
            let xs = gather(x, &cost.variables);
            total += 0.5 * xs.dot(&(&cost.Q * &xs)) + cost.b.dot(&xs) + cost.c;
        }
        for (cost, variables) in &self.generic_costs {
            total += cost.eval(gather(x, variables).as_slice())?;
        }
        Ok(total)
    }

    /// True if `x` satisfies bounds, integrality and every constraint within `tolerance`.
    pub fn check_satisfied(&self, x: &DVector<f64>, tolerance: f64) -> IkResult<bool> {
        Ok(self.max_violation(x)? <= tolerance)
    }

    /// Largest violation over all bounds and constraints at `x`. Any NaN makes it infinite.
    pub fn max_violation(&self, x: &DVector<f64>) -> IkResult<f64> {
        check_dimension("decision variables", self.num_vars(), x.len())?;
        let mut violations = Vec::new();
        for i in 0..self.num_vars() {
            violations.push(self.lower[i] - x[i]);
            violations.push(x[i] - self.upper[i]);
            if self.types[i] == VariableType::Binary {
                violations.push((x[i] - x[i].round()).abs());
            }
        }
        for c in &self.linear_constraints {
            let value = c.expression.evaluate(x);
            violations.push(c.lower - value);
            violations.push(value - c.upper);
        }
        for cone in &self.lorentz_cones {
            let t = cone.expressions[0].evaluate(x);
            let norm = cone.expressions[1..].iter().map(|e| e.evaluate(x).powi(2)).sum::<f64>().sqrt();
            violations.push(norm - t);
        }
        for (constraint, variables) in &self.generic_constraints {
            violations.extend(constraint.violation(&gather(x, variables))?.iter());
        }
        if violations.iter().any(|v| v.is_nan()) {
            return Ok(f64::INFINITY);
        }
        Ok(violations.into_iter().fold(0.0, f64::max))
    }

    /// Variables referenced by any constraint or cost, for diagnostics.
    pub fn used_variables(&self) -> HashSet<Variable> {
        let mut used = HashSet::new();
        for c in &self.linear_constraints {
            used.extend(c.expression.terms.iter().map(|(v, _)| *v));
        }
        for cone in &self.lorentz_cones {
            for e in &cone.expressions {
                used.extend(e.terms.iter().map(|(v, _)| *v));
            }
        }
        for (_, variables) in self.generic_constraints.iter() {
            used.extend(variables.iter().copied());
        }
        for (_, variables) in self.generic_costs.iter() {
            used.extend(variables.iter().copied());
        }
        for e in &self.linear_costs {
            used.extend(e.terms.iter().map(|(v, _)| *v));
        }
        for cost in &self.quadratic_costs {
            used.extend(cost.variables.iter().copied());
        }
        used
    }
}

/// Values of `variables` picked from the full decision vector.
pub(crate) fn gather(x: &DVector<f64>, variables: &[Variable]) -> DVector<f64> {
    DVector::from_iterator(variables.len(), variables.iter().map(|v| x[v.0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_quaternion_constraint::UnitQuaternionConstraint;

    #[test]
    fn test_bounds_intersect() {
        let mut prog = MathematicalProgram::new();
        let x = prog.new_continuous_variables(2, "x");
        prog.add_bounding_box_constraint(&DVector::from_vec(vec![-1.0, 0.0]), &DVector::from_vec(vec![1.0, 5.0]), &x).unwrap();
        prog.add_bounding_box_constraint(&DVector::from_vec(vec![-2.0, 1.0]), &DVector::from_vec(vec![0.5, 6.0]), &x).unwrap();
        assert_eq!(prog.lower_bounds().as_slice(), &[-1.0, 1.0]);
        assert_eq!(prog.upper_bounds().as_slice(), &[0.5, 5.0]);
        assert!(prog.add_bounding_box_constraint(&DVector::zeros(1), &DVector::zeros(2), &x).is_err());
        assert_eq!(prog.variable_name(x[1]), "x(1)");
    }

    #[test]
    fn test_violation_accounts_everything() {
        let mut prog = MathematicalProgram::new();
        let x = prog.new_continuous_variables(4, "x");
        let z = prog.new_binary_variables(1, "z");
        prog.add_linear_constraint(LinearExpression::from(x[0]) + LinearExpression::from(x[1]), 1.0, 1.0).unwrap();
        prog.add_lorentz_cone_constraint(vec![LinearExpression::constant(1.0), x[2].into(), x[3].into()]).unwrap();
        let binding = prog.add_constraint(UnitQuaternionConstraint::new(), &x).unwrap();

        let good = DVector::from_vec(vec![0.5, 0.5, 0.5, 0.5, 1.0]);
        assert!(prog.check_satisfied(&good, 1e-12).unwrap());
        let fractional = DVector::from_vec(vec![0.5, 0.5, 0.5, 0.5, 0.4]);
        assert!((prog.max_violation(&fractional).unwrap() - 0.4).abs() < 1e-12);
        let outside_cone = DVector::from_vec(vec![0.5, 0.5, 1.0, 1.0, 0.0]);
        assert!(!prog.check_satisfied(&outside_cone, 1e-3).unwrap());

        assert_eq!(prog.constraint(&binding).unwrap().num_vars(), 4);
        assert_eq!(z[0].index(), 4);
    }

    #[test]
    fn test_nan_point_is_never_satisfied() {
        let mut prog = MathematicalProgram::new();
        let x = prog.new_continuous_variables(4, "x");
        prog.add_constraint(UnitQuaternionConstraint::new(), &x).unwrap();
        let nan = DVector::from_vec(vec![f64::NAN, 0.0, 0.0, 0.0]);
        assert_eq!(prog.max_violation(&nan).unwrap(), f64::INFINITY);
        assert!(!prog.check_satisfied(&nan, 1e3).unwrap());
    }

    #[test]
    fn test_typed_binding_lookup() {
        let mut prog = MathematicalProgram::new();
        let x = prog.new_continuous_variables(4, "x");
        let binding = prog.add_constraint(IkConstraint::UnitQuaternion(UnitQuaternionConstraint::new()), &x).unwrap();
        assert!(prog.constraint_mut(&binding).is_ok());
        assert!(prog.add_constraint(UnitQuaternionConstraint::new(), &x[..3]).is_err());
    }

    #[test]
    fn test_cost_evaluation() {
        let mut prog = MathematicalProgram::new();
        let x = prog.new_continuous_variables(2, "x");
        prog.add_linear_cost(LinearExpression::from(x[0]) * 2.0 + LinearExpression::constant(1.0)).unwrap();
        prog.add_quadratic_cost(&DMatrix::identity(2, 2), &DVector::zeros(2), 0.5, &x).unwrap();
        let value = prog.evaluate_cost(&DVector::from_vec(vec![1.0, 2.0])).unwrap();
        // 2 + 1 + 0.5 * 5 + 0.5
        assert!((value - 6.0).abs() < 1e-12);
    }
}
