//! Unit length of the quaternion block of floating joints.

use nalgebra::DVector;

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::error::{check_dimension, IkResult};
use crate::mathematical_program::{Binding, MathematicalProgram, Variable};
use crate::plant::MultibodyPlant;

/// `|v|² - 1 = 0` over four variables. Purely algebraic, no plant involved.
#[derive(Clone, Debug)]
pub struct UnitQuaternionConstraint {
    bounds: ConstraintBounds,
}

impl Default for UnitQuaternionConstraint {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitQuaternionConstraint {
    pub fn new() -> Self {
        UnitQuaternionConstraint { bounds: ConstraintBounds::equality(DVector::zeros(1)) }
    }
}

impl Constraint for UnitQuaternionConstraint {
    fn description(&self) -> &'static str {
        "unit quaternion constraint"
    }

    fn num_vars(&self) -> usize {
        4
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let mut squared_norm = T::zero();
        for v in x {
            squared_norm += v.clone() * v.clone();
        }
        Ok(vec![squared_norm - T::one()])
    }
}

/// For every quaternion floating joint of `plant`, constrains its quaternion entries of `q_vars`
/// to unit length and boxes them in `[-1, 1]`.
pub fn add_unit_quaternion_constraint_on_plant(
    plant: &MultibodyPlant,
    q_vars: &[Variable],
    prog: &mut MathematicalProgram,
) -> IkResult<Vec<Binding<UnitQuaternionConstraint>>> {
    check_dimension("generalized position variables", plant.num_positions(), q_vars.len())?;
    let mut bindings = Vec::new();
    for joint in plant.quaternion_floating_joints() {
        let quaternion = &q_vars[joint.position_start..joint.position_start + 4];
        prog.add_bounding_box_constraint(&DVector::from_element(4, -1.0), &DVector::from_element(4, 1.0), quaternion)?;
        bindings.push(prog.add_constraint(UnitQuaternionConstraint::new(), quaternion)?);
    }
    Ok(bindings)
}
