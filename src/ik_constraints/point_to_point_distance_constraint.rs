//! Distance between two points fixed on (possibly different) frames.

use std::sync::Arc;

use nalgebra::{DVector, Vector3};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{IkError, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};
use crate::utils::norm;

#[derive(Clone, Debug)]
pub struct PointToPointDistanceConstraint {
    evaluator: KinematicEvaluator,
    frame1: FrameIndex,
    p_B1P1: Vector3<f64>,
    frame2: FrameIndex,
    p_B2P2: Vector3<f64>,
    bounds: ConstraintBounds,
}

impl PointToPointDistanceConstraint {
    /// `distance_lower <= |p_P1 - p_P2| <= distance_upper`, with `0 <= distance_lower`.
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame1: FrameIndex,
        p_B1P1: &Vector3<f64>,
        frame2: FrameIndex,
        p_B2P2: &Vector3<f64>,
        distance_lower: f64,
        distance_upper: f64,
        context: SharedContext,
    ) -> IkResult<Self> {
        if !(distance_lower >= 0.0) {
            return Err(IkError::InvalidArgument(format!(
                "distance_lower must be non-negative, got {}",
                distance_lower
            )));
        }
        plant.frame(frame1)?;
        plant.frame(frame2)?;
        Ok(PointToPointDistanceConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame1,
            p_B1P1: *p_B1P1,
            frame2,
            p_B2P2: *p_B2P2,
            bounds: ConstraintBounds::new(
                "point to point distance bounds",
                DVector::from_element(1, distance_lower),
                DVector::from_element(1, distance_upper),
            )?,
        })
    }
}

impl Constraint for PointToPointDistanceConstraint {
    fn description(&self) -> &'static str {
        "point to point distance constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        self.evaluator.with_body_poses(x, |poses| {
            let plant = self.evaluator.plant();
            let p_WP1 = plant.frame_pose_from_body_poses(poses, self.frame1)?.transform_point_f64(&self.p_B1P1);
            let p_WP2 = plant.frame_pose_from_body_poses(poses, self.frame2)?.transform_point_f64(&self.p_B2P2);
            Ok(vec![norm(&(p_WP1 - p_WP2))])
        })
    }
}
