//! Bounds the angle between two frames.

use std::f64::consts::PI;
use std::sync::Arc;

use nalgebra::{DVector, Rotation3};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{check_angle, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};
use crate::utils::rotation_angle;

/// Frame A is fixed to the plant frame Abar by `R_AbarA`, frame B to Bbar by `R_BbarB`.
/// The residual is the angle `theta` of `R_AB`, constrained to `[0, theta_bound]`.
#[derive(Clone, Debug)]
pub struct OrientationConstraint {
    evaluator: KinematicEvaluator,
    frame_abar: FrameIndex,
    R_AAbar: Rotation3<f64>,
    frame_bbar: FrameIndex,
    R_BbarB: Rotation3<f64>,
    bounds: ConstraintBounds,
}

impl OrientationConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_abar: FrameIndex,
        R_AbarA: &Rotation3<f64>,
        frame_bbar: FrameIndex,
        R_BbarB: &Rotation3<f64>,
        theta_bound: f64,
        context: SharedContext,
    ) -> IkResult<Self> {
        check_angle("theta_bound", theta_bound, 0.0, PI)?;
        plant.frame(frame_abar)?;
        plant.frame(frame_bbar)?;
        Ok(OrientationConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_abar,
            R_AAbar: R_AbarA.inverse(),
            frame_bbar,
            R_BbarB: *R_BbarB,
            bounds: ConstraintBounds::new(
                "orientation bounds",
                DVector::zeros(1),
                DVector::from_element(1, theta_bound),
            )?,
        })
    }

    pub fn theta_bound(&self) -> f64 {
        self.bounds.upper()[0]
    }
}

impl Constraint for OrientationConstraint {
    fn description(&self) -> &'static str {
        "orientation constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let X_AbarBbar = self.evaluator.relative_pose(x, self.frame_abar, self.frame_bbar)?;
        let R_AB = self.R_AAbar.matrix().map(T::from_f64)
            * X_AbarBbar.rotation
            * self.R_BbarB.matrix().map(T::from_f64);
        Ok(vec![rotation_angle(&R_AB)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IkError;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{Isometry3, Vector3};

    fn turntable() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let table = builder.add_rigid_body("table", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("spin", JointType::Revolute { axis: Vector3::z_axis() },
                          WORLD_BODY, Isometry3::identity(), table, None);
        let frame = builder.add_frame("top", table, Isometry3::translation(0.0, 0.0, 0.1));
        (Arc::new(builder.build().unwrap()), frame)
    }

    #[test]
    fn test_angle_follows_joint() {
        let (plant, top) = turntable();
        let constraint = OrientationConstraint::new(
            plant.clone(), plant.world_frame(), &Rotation3::identity(), top, &Rotation3::identity(),
            0.5, plant.create_shared_context(),
        ).unwrap();
        for angle in [0.0, 0.3, -1.2, 3.0] {
            let r = constraint.eval_values(&DVector::from_vec(vec![angle])).unwrap();
            assert!((r[0] - f64::abs(angle)).abs() < 1e-9, "angle {} gave {}", angle, r[0]);
        }
        assert!(constraint.check_satisfied(&DVector::from_vec(vec![0.4]), 1e-9).unwrap());
        assert!(!constraint.check_satisfied(&DVector::from_vec(vec![0.6]), 1e-9).unwrap());
    }

    #[test]
    fn test_offsets_cancel() {
        let (plant, top) = turntable();
        // A is rotated by 0.7 about z from the world, and the table is turned by the same amount
        let R = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.7);
        let constraint = OrientationConstraint::new(
            plant.clone(), plant.world_frame(), &R, top, &Rotation3::identity(), 0.0, plant.create_shared_context(),
        ).unwrap();
        let r = constraint.eval_values(&DVector::from_vec(vec![0.7])).unwrap();
        assert!(r[0].abs() < 1e-7);
        assert!(constraint.check_satisfied(&DVector::from_vec(vec![0.7]), 1e-7).unwrap());
    }

    #[test]
    fn test_theta_bound_range() {
        let (plant, top) = turntable();
        for bad in [-0.1, PI + 0.01, f64::NAN] {
            let result = OrientationConstraint::new(
                plant.clone(), plant.world_frame(), &Rotation3::identity(), top, &Rotation3::identity(),
                bad, plant.create_shared_context(),
            );
            assert!(matches!(result, Err(IkError::AngleOutOfRange { .. })));
        }
    }
}
