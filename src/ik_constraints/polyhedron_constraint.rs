//! Points fixed on frame G, constrained jointly to a polyhedron in frame F.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix3xX};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{check_dimension, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};

/// `A * [p_FP1; p_FP2; ...] <= b`, where `p_GP` holds one point per column.
#[derive(Clone, Debug)]
pub struct PolyhedronConstraint {
    evaluator: KinematicEvaluator,
    frame_f: FrameIndex,
    frame_g: FrameIndex,
    p_GP: Matrix3xX<f64>,
    A: DMatrix<f64>,
    bounds: ConstraintBounds,
}

impl PolyhedronConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_f: FrameIndex,
        frame_g: FrameIndex,
        p_GP: &Matrix3xX<f64>,
        A: &DMatrix<f64>,
        b: &DVector<f64>,
        context: SharedContext,
    ) -> IkResult<Self> {
        check_dimension("polyhedron A columns", 3 * p_GP.ncols(), A.ncols())?;
        check_dimension("polyhedron b", A.nrows(), b.len())?;
        plant.frame(frame_f)?;
        plant.frame(frame_g)?;
        Ok(PolyhedronConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_f,
            frame_g,
            p_GP: p_GP.clone(),
            A: A.clone(),
            bounds: ConstraintBounds::at_most(b.clone()),
        })
    }
}

/// `A * v` for a constant matrix and a generic vector, skipping structural zeros.
pub(crate) fn constant_times<T: IkScalar>(A: &DMatrix<f64>, v: &[T]) -> Vec<T> {
    (0..A.nrows())
        .map(|row| {
            let mut sum = T::zero();
            for (col, value) in v.iter().enumerate() {
                let a = A[(row, col)];
                if a != 0.0 {
                    sum += value.scale(a);
                }
            }
            sum
        })
        .collect()
}

impl Constraint for PolyhedronConstraint {
    fn description(&self) -> &'static str {
        "polyhedron constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let X_FG = self.evaluator.relative_pose(x, self.frame_f, self.frame_g)?;
        let mut stacked = Vec::with_capacity(3 * self.p_GP.ncols());
        for column in self.p_GP.column_iter() {
            let p_FP = X_FG.transform_point_f64(&column.into_owned());
            stacked.extend(p_FP.iter().cloned());
        }
        Ok(constant_times(&self.A, &stacked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IkError;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{Isometry3, Vector3};

    fn rotating_bar() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let bar = builder.add_rigid_body("bar", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("pivot", JointType::Revolute { axis: Vector3::z_axis() },
                          WORLD_BODY, Isometry3::identity(), bar, None);
        let plant = Arc::new(builder.build().unwrap());
        let frame = plant.body_frame(bar).unwrap();
        (plant, frame)
    }

    #[test]
    fn test_both_ends_below_plane() {
        let (plant, bar) = rotating_bar();
        // Bar ends at x = +1 and x = -1, both must satisfy y <= 0.5
        let p_GP = Matrix3xX::from_columns(&[Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)]);
        let A = DMatrix::from_row_slice(2, 6, &[
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0, 1.0, 0.0,
        ]);
        let b = DVector::from_element(2, 0.5);
        let constraint = PolyhedronConstraint::new(
            plant.clone(), plant.world_frame(), bar, &p_GP, &A, &b, plant.create_shared_context(),
        ).unwrap();

        let r = constraint.eval_values(&DVector::from_vec(vec![std::f64::consts::FRAC_PI_6])).unwrap();
        assert!((r[0] - 0.5).abs() < 1e-12);
        assert!((r[1] + 0.5).abs() < 1e-12);
        assert!(constraint.check_satisfied(&DVector::from_vec(vec![0.5]), 0.0).unwrap());
        assert!(!constraint.check_satisfied(&DVector::from_vec(vec![0.6]), 0.0).unwrap());
        assert!(!constraint.check_satisfied(&DVector::from_vec(vec![-0.6]), 0.0).unwrap());
    }

    #[test]
    fn test_dimension_checks() {
        let (plant, bar) = rotating_bar();
        let p_GP = Matrix3xX::from_columns(&[Vector3::zeros()]);
        let wrong_a = PolyhedronConstraint::new(
            plant.clone(), plant.world_frame(), bar, &p_GP, &DMatrix::zeros(1, 4), &DVector::zeros(1),
            plant.create_shared_context(),
        );
        assert!(matches!(wrong_a, Err(IkError::DimensionMismatch { .. })));
        let wrong_b = PolyhedronConstraint::new(
            plant.clone(), plant.world_frame(), bar, &p_GP, &DMatrix::zeros(2, 3), &DVector::zeros(1),
            plant.create_shared_context(),
        );
        assert!(matches!(wrong_b, Err(IkError::DimensionMismatch { .. })));
    }
}
