//! Keeps a target point inside a viewing cone.

use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

use nalgebra::{DVector, Vector3};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{check_angle, check_direction, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};
use crate::utils::dot;

/// The cone has its apex at S, fixed in frame A at `p_AS`, axis `n_A` and half angle
/// `cone_half_angle`. The target T is fixed in frame B at `p_BT`.
///
/// With `d = p_AT - p_AS` and unit `n`, the residuals are `[n·d, (n·d)² - cos²(α)|d|²]`, both
/// bounded below by zero. The first keeps T in front of the apex, the second inside the cone.
/// A target at the apex itself satisfies the constraint.
#[derive(Clone, Debug)]
pub struct GazeTargetConstraint {
    evaluator: KinematicEvaluator,
    frame_a: FrameIndex,
    p_AS: Vector3<f64>,
    n_A: Vector3<f64>,
    frame_b: FrameIndex,
    p_BT: Vector3<f64>,
    cos_cone_half_angle: f64,
    bounds: ConstraintBounds,
}

impl GazeTargetConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_a: FrameIndex,
        p_AS: &Vector3<f64>,
        n_A: &Vector3<f64>,
        frame_b: FrameIndex,
        p_BT: &Vector3<f64>,
        cone_half_angle: f64,
        context: SharedContext,
    ) -> IkResult<Self> {
        let n_A = check_direction("n_A", n_A)?;
        check_angle("cone_half_angle", cone_half_angle, 0.0, FRAC_PI_2)?;
        plant.frame(frame_a)?;
        plant.frame(frame_b)?;
        Ok(GazeTargetConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_a,
            p_AS: *p_AS,
            n_A,
            frame_b,
            p_BT: *p_BT,
            cos_cone_half_angle: cone_half_angle.cos(),
            bounds: ConstraintBounds::at_least(DVector::zeros(2)),
        })
    }
}

impl Constraint for GazeTargetConstraint {
    fn description(&self) -> &'static str {
        "gaze target constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let p_AT = self.evaluator.point_in_frame(x, self.frame_b, &self.p_BT, self.frame_a)?;
        let d = p_AT - self.p_AS.map(T::from_f64);
        let n_dot_d = dot(&self.n_A.map(T::from_f64), &d);
        let cos2 = self.cos_cone_half_angle * self.cos_cone_half_angle;
        let inside = n_dot_d.clone() * n_dot_d.clone() - dot(&d, &d).scale(cos2);
        Ok(vec![n_dot_d, inside])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IkError;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::Isometry3;
    use std::f64::consts::PI;

    /// A target on a unit arm rotating about z, watched from the origin along x.
    fn target_on_arm() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let arm = builder.add_rigid_body("arm", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("yaw", JointType::Revolute { axis: Vector3::z_axis() },
                          WORLD_BODY, Isometry3::identity(), arm, None);
        let target = builder.add_frame("target", arm, Isometry3::translation(1.0, 0.0, 0.0));
        (Arc::new(builder.build().unwrap()), target)
    }

    fn gaze(plant: &Arc<MultibodyPlant>, target: FrameIndex, half_angle: f64) -> GazeTargetConstraint {
        GazeTargetConstraint::new(
            plant.clone(), plant.world_frame(), &Vector3::zeros(), &Vector3::new(2.0, 0.0, 0.0),
            target, &Vector3::zeros(), half_angle, plant.create_shared_context(),
        ).unwrap()
    }

    #[test]
    fn test_cone_membership() {
        let (plant, target) = target_on_arm();
        let constraint = gaze(&plant, target, PI / 6.0);
        // Inside for |yaw| < 30 degrees, outside beyond
        for (yaw, inside) in [(0.0, true), (0.5, true), (-0.5, true), (0.6, false), (2.0, false), (PI, false)] {
            let satisfied = constraint.check_satisfied(&DVector::from_vec(vec![yaw]), 1e-12).unwrap();
            assert_eq!(satisfied, inside, "yaw {}", yaw);
        }
    }

    #[test]
    fn test_residual_values() {
        let (plant, target) = target_on_arm();
        let constraint = gaze(&plant, target, 0.0);
        let r = constraint.eval_values(&DVector::from_vec(vec![PI / 3.0])).unwrap();
        assert!((r[0] - 0.5).abs() < 1e-12);
        assert!((r[1] - (0.25 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_rear_cone_rejected() {
        // Behind the apex the squared residual alone would be satisfied
        let (plant, target) = target_on_arm();
        let constraint = gaze(&plant, target, PI / 4.0);
        let r = constraint.eval_values(&DVector::from_vec(vec![PI])).unwrap();
        assert!(r[1] >= 0.0);
        assert!(r[0] < 0.0);
    }

    #[test]
    fn test_half_angle_range() {
        let (plant, target) = target_on_arm();
        for bad in [-0.01, FRAC_PI_2 + 0.01] {
            let result = GazeTargetConstraint::new(
                plant.clone(), plant.world_frame(), &Vector3::zeros(), &Vector3::x(),
                target, &Vector3::zeros(), bad, plant.create_shared_context(),
            );
            assert!(matches!(result, Err(IkError::AngleOutOfRange { .. })));
        }
    }
}
