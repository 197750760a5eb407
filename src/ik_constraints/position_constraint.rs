//! Position of a point Q, fixed in frame B, measured in frame A.

use std::sync::Arc;

use nalgebra::{DVector, Vector3};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::IkResult;
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::kinematic_traits::{GenericPose, Pose};
use crate::plant::{FrameIndex, MultibodyPlant};

/// Constrains `p_AQ` to the box `[p_AQ_lower, p_AQ_upper]`.
///
/// Frame A may be given as a fixed offset `X_AbarA` from a plant frame Abar, which allows bounding
/// a point in a frame that does not exist in the plant (for instance a rotated copy of the world).
#[derive(Clone, Debug)]
pub struct PositionConstraint {
    evaluator: KinematicEvaluator,
    frame_abar: FrameIndex,
    X_AAbar: Pose,
    frame_b: FrameIndex,
    p_BQ: Vector3<f64>,
    bounds: ConstraintBounds,
}

impl PositionConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_a: FrameIndex,
        p_AQ_lower: &Vector3<f64>,
        p_AQ_upper: &Vector3<f64>,
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        context: SharedContext,
    ) -> IkResult<Self> {
        Self::with_bar_frame(plant, frame_a, None, p_AQ_lower, p_AQ_upper, frame_b, p_BQ, context)
    }

    /// Bounds are expressed in frame A, which is fixed to `frame_abar` at `X_AbarA`
    /// (identity when `None`).
    pub fn with_bar_frame(
        plant: Arc<MultibodyPlant>,
        frame_abar: FrameIndex,
        X_AbarA: Option<Pose>,
        p_AQ_lower: &Vector3<f64>,
        p_AQ_upper: &Vector3<f64>,
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        context: SharedContext,
    ) -> IkResult<Self> {
        plant.frame(frame_abar)?;
        plant.frame(frame_b)?;
        let bounds = ConstraintBounds::new(
            "position bounds",
            DVector::from_column_slice(p_AQ_lower.as_slice()),
            DVector::from_column_slice(p_AQ_upper.as_slice()),
        )?;
        Ok(PositionConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_abar,
            X_AAbar: X_AbarA.unwrap_or_else(Pose::identity).inverse(),
            frame_b,
            p_BQ: *p_BQ,
            bounds,
        })
    }

    pub fn set_bounds(&mut self, lower: &DVector<f64>, upper: &DVector<f64>) -> IkResult<()> {
        self.bounds.set("position bounds", lower, upper)
    }

    pub fn update_lower_bound(&mut self, lower: &DVector<f64>) -> IkResult<()> {
        self.bounds.set_lower("position lower bound", lower)
    }

    pub fn update_upper_bound(&mut self, upper: &DVector<f64>) -> IkResult<()> {
        self.bounds.set_upper("position upper bound", upper)
    }
}

impl Constraint for PositionConstraint {
    fn description(&self) -> &'static str {
        "position constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let p_AbarQ = self.evaluator.point_in_frame(x, self.frame_b, &self.p_BQ, self.frame_abar)?;
        let p_AQ = GenericPose::<T>::from_isometry(&self.X_AAbar).transform_point(&p_AbarQ);
        Ok(p_AQ.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IkError;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{Isometry3, Vector3};

    fn arm() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let l1 = builder.add_rigid_body("l1", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        let l2 = builder.add_rigid_body("l2", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("j1", JointType::Revolute { axis: Vector3::z_axis() },
                          WORLD_BODY, Isometry3::identity(), l1, None);
        builder.add_joint("j2", JointType::Revolute { axis: Vector3::z_axis() },
                          l1, Isometry3::translation(1.0, 0.0, 0.0), l2, None);
        let tip = builder.add_frame("tip", l2, Isometry3::translation(1.0, 0.0, 0.0));
        (Arc::new(builder.build().unwrap()), tip)
    }

    #[test]
    fn test_residual_is_tip_position() {
        let (plant, tip) = arm();
        let lower = Vector3::new(1.5, 0.5, -0.1);
        let upper = Vector3::new(2.5, 1.5, 0.1);
        let constraint = PositionConstraint::new(
            plant.clone(), plant.world_frame(), &lower, &upper, tip, &Vector3::zeros(), plant.create_shared_context(),
        ).unwrap();

        let q = DVector::from_vec(vec![std::f64::consts::FRAC_PI_2, -std::f64::consts::FRAC_PI_2]);
        let r = constraint.eval_values(&q).unwrap();
        assert!((r - DVector::from_vec(vec![1.0, 1.0, 0.0])).norm() < 1e-12);
        assert!(!constraint.check_satisfied(&q, 1e-9).unwrap());
        assert!(constraint.check_satisfied(&DVector::from_vec(vec![0.6, -0.6]), 1e-9).unwrap());
    }

    #[test]
    fn test_bar_frame_offset() {
        let (plant, tip) = arm();
        // Frame A sits at (2, 0, 0) in world, rotated by 90 degrees about z
        let X_WA = Isometry3::new(Vector3::new(2.0, 0.0, 0.0), Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        let constraint = PositionConstraint::with_bar_frame(
            plant.clone(), plant.world_frame(), Some(X_WA),
            &Vector3::from_element(-1.0), &Vector3::from_element(1.0),
            tip, &Vector3::zeros(), plant.create_shared_context(),
        ).unwrap();
        // Tip at (2, 0, 0) coincides with the origin of A
        let r = constraint.eval_values(&DVector::zeros(2)).unwrap();
        assert!(r.norm() < 1e-12);
        // Tip at (1, 1, 0) is at (1, 1, 0) - (2, 0, 0) = (-1, 1, 0) in world axes, (1, 1, 0) in A
        let r = constraint.eval_values(&DVector::from_vec(vec![0.0, std::f64::consts::FRAC_PI_2])).unwrap();
        assert!((r - DVector::from_vec(vec![1.0, 1.0, 0.0])).norm() < 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let (plant, tip) = arm();
        let constraint = PositionConstraint::new(
            plant.clone(), plant.world_frame(), &Vector3::zeros(), &Vector3::zeros(), tip,
            &Vector3::new(0.1, 0.2, 0.0), plant.create_shared_context(),
        ).unwrap();
        let q = DVector::from_vec(vec![0.3, -1.1]);
        let (r, jacobian) = constraint.eval_with_gradient(&q).unwrap();
        let eps = 1e-7;
        for j in 0..2 {
            let mut dq = q.clone();
            dq[j] += eps;
            let column = (constraint.eval_values(&dq).unwrap() - &r) / eps;
            for i in 0..3 {
                assert!((column[i] - jacobian[(i, j)]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_bound_updates_validated() {
        let (plant, tip) = arm();
        let mut constraint = PositionConstraint::new(
            plant.clone(), plant.world_frame(), &Vector3::zeros(), &Vector3::zeros(), tip,
            &Vector3::zeros(), plant.create_shared_context(),
        ).unwrap();
        assert!(matches!(constraint.update_lower_bound(&DVector::zeros(2)), Err(IkError::DimensionMismatch { .. })));
        assert!(matches!(constraint.update_lower_bound(&DVector::from_element(3, 1.0)), Err(IkError::InvalidBounds { .. })));
        constraint.set_bounds(&DVector::from_element(3, -2.0), &DVector::from_element(3, 2.0)).unwrap();
        assert!(constraint.check_satisfied(&DVector::zeros(2), 0.0).unwrap());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let (plant, tip) = arm();
        let result = PositionConstraint::new(
            plant.clone(), plant.world_frame(), &Vector3::new(0.0, 1.0, 0.0), &Vector3::zeros(), tip,
            &Vector3::zeros(), plant.create_shared_context(),
        );
        assert!(matches!(result, Err(IkError::InvalidBounds { index: 1, .. })));
    }
}
