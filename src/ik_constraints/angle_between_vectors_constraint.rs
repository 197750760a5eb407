//! Angle between a vector fixed in frame A and a vector fixed in frame B.

use std::f64::consts::PI;
use std::sync::Arc;

use nalgebra::{DVector, Vector3};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{check_angle, check_direction, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};
use crate::utils::angle_between;

/// `angle_lower <= angle(a, b) <= angle_upper`, both vectors expressed in world.
#[derive(Clone, Debug)]
pub struct AngleBetweenVectorsConstraint {
    evaluator: KinematicEvaluator,
    frame_a: FrameIndex,
    a_A: Vector3<f64>,
    frame_b: FrameIndex,
    b_B: Vector3<f64>,
    bounds: ConstraintBounds,
}

impl AngleBetweenVectorsConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_a: FrameIndex,
        a_A: &Vector3<f64>,
        frame_b: FrameIndex,
        b_B: &Vector3<f64>,
        angle_lower: f64,
        angle_upper: f64,
        context: SharedContext,
    ) -> IkResult<Self> {
        let a_A = check_direction("a_A", a_A)?;
        let b_B = check_direction("b_B", b_B)?;
        check_angle("angle_lower", angle_lower, 0.0, PI)?;
        check_angle("angle_upper", angle_upper, angle_lower, PI)?;
        plant.frame(frame_a)?;
        plant.frame(frame_b)?;
        Ok(AngleBetweenVectorsConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_a,
            a_A,
            frame_b,
            b_B,
            bounds: ConstraintBounds::new(
                "angle bounds",
                DVector::from_element(1, angle_lower),
                DVector::from_element(1, angle_upper),
            )?,
        })
    }
}

impl Constraint for AngleBetweenVectorsConstraint {
    fn description(&self) -> &'static str {
        "angle between vectors constraint"
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
            let R_WA = plant.frame_pose_from_body_poses(poses, self.frame_a)?.rotation;
            let R_WB = plant.frame_pose_from_body_poses(poses, self.frame_b)?.rotation;
            let a_W = R_WA * self.a_A.map(T::from_f64);
            let b_W = R_WB * self.b_B.map(T::from_f64);
            Ok(vec![angle_between(&a_W, &b_W)])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IkError;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::Isometry3;

    fn hinge() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let lid = builder.add_rigid_body("lid", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("hinge", JointType::Revolute { axis: Vector3::y_axis() },
                          WORLD_BODY, Isometry3::identity(), lid, None);
        let frame = builder.add_frame("lid_frame", lid, Isometry3::identity());
        (Arc::new(builder.build().unwrap()), frame)
    }

    fn constraint(plant: &Arc<MultibodyPlant>, lid: FrameIndex, a: Vector3<f64>, b: Vector3<f64>) -> AngleBetweenVectorsConstraint {
        AngleBetweenVectorsConstraint::new(
            plant.clone(), plant.world_frame(), &a, lid, &b, 0.0, PI, plant.create_shared_context(),
        ).unwrap()
    }

    #[test]
    fn test_angle_tracks_hinge() {
        let (plant, lid) = hinge();
        let c = constraint(&plant, lid, Vector3::x(), Vector3::x() * 3.0);
        for angle in [0.0, 0.4, 1.5, 2.9] {
            let r = c.eval_values(&DVector::from_vec(vec![angle])).unwrap();
            assert!((r[0] - angle).abs() < 1e-9);
        }
    }

    #[test]
    fn test_negation_symmetry() {
        let (plant, lid) = hinge();
        let a = Vector3::new(1.0, 0.2, -0.3);
        let b = Vector3::new(0.1, -0.5, 0.8);
        let q = DVector::from_vec(vec![0.77]);
        let phi = constraint(&plant, lid, a, b).eval_values(&q).unwrap()[0];
        let both = constraint(&plant, lid, -a, -b).eval_values(&q).unwrap()[0];
        let one = constraint(&plant, lid, -a, b).eval_values(&q).unwrap()[0];
        assert!((both - phi).abs() < 1e-12);
        assert!((one - (PI - phi)).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_arguments() {
        let (plant, lid) = hinge();
        let zero = AngleBetweenVectorsConstraint::new(
            plant.clone(), plant.world_frame(), &Vector3::zeros(), lid, &Vector3::x(), 0.0, 1.0,
            plant.create_shared_context(),
        );
        assert!(matches!(zero, Err(IkError::InvalidArgument(_))));
        let inverted = AngleBetweenVectorsConstraint::new(
            plant.clone(), plant.world_frame(), &Vector3::x(), lid, &Vector3::x(), 1.0, 0.5,
            plant.create_shared_context(),
        );
        assert!(matches!(inverted, Err(IkError::AngleOutOfRange { .. })));
    }
}
