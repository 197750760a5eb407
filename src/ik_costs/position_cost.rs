//! Weighted squared distance between a point on frame A and a point on frame B.

use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};

use crate::autodiff::IkScalar;
use crate::context::SharedContext;
use crate::costs::Cost;
use crate::error::{IkError, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};
use crate::utils::dot;

/// `eᵀ C e` with `e = p_AP - p_AQ`, P fixed in A and Q fixed in B.
#[derive(Clone, Debug)]
pub struct PositionCost {
    evaluator: KinematicEvaluator,
    frame_a: FrameIndex,
    p_AP: Vector3<f64>,
    frame_b: FrameIndex,
    p_BQ: Vector3<f64>,
    C: Matrix3<f64>,
}

impl PositionCost {
    /// `C` must be symmetric positive semidefinite.
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_a: FrameIndex,
        p_AP: &Vector3<f64>,
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        C: &Matrix3<f64>,
        context: SharedContext,
    ) -> IkResult<Self> {
        if (C - C.transpose()).amax() > 1e-12 * (1.0 + C.amax()) {
            return Err(IkError::InvalidArgument(format!("C must be symmetric, got {}", C)));
        }
        if C.symmetric_eigenvalues().min() < -1e-12 * (1.0 + C.amax()) {
            return Err(IkError::InvalidArgument(format!("C must be positive semidefinite, got {}", C)));
        }
        plant.frame(frame_a)?;
        plant.frame(frame_b)?;
        Ok(PositionCost {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_a,
            p_AP: *p_AP,
            frame_b,
            p_BQ: *p_BQ,
            C: *C,
        })
    }
}

impl Cost for PositionCost {
    fn description(&self) -> &'static str {
        "position cost"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<T> {
        let p_AQ = self.evaluator.point_in_frame(x, self.frame_b, &self.p_BQ, self.frame_a)?;
        let e = self.p_AP.map(T::from_f64) - p_AQ;
        let Ce = self.C.map(T::from_f64) * e.clone();
        Ok(dot(&e, &Ce))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{DVector, Isometry3};

    fn slider() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let body = builder.add_rigid_body("carriage", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("rail", JointType::Prismatic { axis: Vector3::x_axis() },
                          WORLD_BODY, Isometry3::identity(), body, Some((-3.0, 3.0)));
        let plant = Arc::new(builder.build().unwrap());
        let frame = plant.body_frame(body).unwrap();
        (plant, frame)
    }

    #[test]
    fn test_weighted_squared_error() {
        let (plant, carriage) = slider();
        let C = Matrix3::from_diagonal(&Vector3::new(2.0, 1.0, 1.0));
        let cost = PositionCost::new(
            plant.clone(), plant.world_frame(), &Vector3::new(1.0, 1.0, 0.0), carriage, &Vector3::zeros(),
            &C, plant.create_shared_context(),
        ).unwrap();
        let (value, gradient) = cost.eval_with_gradient(&DVector::from_vec(vec![-1.0])).unwrap();
        // e = (2, 1, 0): 2 * 4 + 1 = 9, d/dq = -2 * 2 * 2 = -8
        assert!((value - 9.0).abs() < 1e-12);
        assert!((gradient[0] + 8.0).abs() < 1e-12);
        assert!((cost.eval(&[1.0]).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_indefinite_weight_rejected() {
        let (plant, carriage) = slider();
        let C = Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, 1.0));
        assert!(PositionCost::new(
            plant.clone(), plant.world_frame(), &Vector3::zeros(), carriage, &Vector3::zeros(),
            &C, plant.create_shared_context(),
        ).is_err());
        let mut asymmetric = Matrix3::identity();
        asymmetric[(0, 1)] = 0.5;
        assert!(PositionCost::new(
            plant.clone(), plant.world_frame(), &Vector3::zeros(), carriage, &Vector3::zeros(),
            &asymmetric, plant.create_shared_context(),
        ).is_err());
    }
}
