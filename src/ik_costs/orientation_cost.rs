//! Penalizes the rotation angle between two frames.

use std::sync::Arc;

use nalgebra::Rotation3;

use crate::autodiff::IkScalar;
use crate::context::SharedContext;
use crate::costs::Cost;
use crate::error::{IkError, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};
use crate::utils::trace;

/// `c (1 - cos θ)` where θ is the angle of `R_AB`, computed as `c (3 - tr R_AB) / 2`.
/// Smooth everywhere, unlike θ itself.
#[derive(Clone, Debug)]
pub struct OrientationCost {
    evaluator: KinematicEvaluator,
    frame_abar: FrameIndex,
    R_AAbar: Rotation3<f64>,
    frame_bbar: FrameIndex,
    R_BbarB: Rotation3<f64>,
    c: f64,
}

impl OrientationCost {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        frame_abar: FrameIndex,
        R_AbarA: &Rotation3<f64>,
        frame_bbar: FrameIndex,
        R_BbarB: &Rotation3<f64>,
        c: f64,
        context: SharedContext,
    ) -> IkResult<Self> {
        if !(c.is_finite() && c >= 0.0) {
            return Err(IkError::InvalidArgument(format!("Orientation cost weight must be non-negative, got {}", c)));
        }
        plant.frame(frame_abar)?;
        plant.frame(frame_bbar)?;
        Ok(OrientationCost {
            evaluator: KinematicEvaluator::new(plant, context)?,
            frame_abar,
            R_AAbar: R_AbarA.inverse(),
            frame_bbar,
            R_BbarB: *R_BbarB,
            c,
        })
    }
}

impl Cost for OrientationCost {
    fn description(&self) -> &'static str {
        "orientation cost"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<T> {
        let X_AbarBbar = self.evaluator.relative_pose(x, self.frame_abar, self.frame_bbar)?;
        let R_AB = self.R_AAbar.matrix().map(T::from_f64)
            * X_AbarBbar.rotation
            * self.R_BbarB.matrix().map(T::from_f64);
        Ok((T::from_f64(3.0) - trace(&R_AB)).scale(0.5 * self.c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{DVector, Isometry3, Vector3};

    #[test]
    fn test_cost_is_weighted_one_minus_cosine() {
        let mut builder = MultibodyPlantBuilder::new();
        let body = builder.add_rigid_body("dial", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("turn", JointType::Revolute { axis: Vector3::z_axis() },
                          WORLD_BODY, Isometry3::identity(), body, None);
        let plant = Arc::new(builder.build().unwrap());
        let dial = plant.body_frame(body).unwrap();
        let target = Rotation3::from_axis_angle(&Vector3::z_axis(), 0.5);
        let cost = OrientationCost::new(
            plant.clone(), plant.world_frame(), &target, dial, &Rotation3::identity(), 3.0,
            plant.create_shared_context(),
        ).unwrap();

        for q in [0.5, 1.0, -2.0] {
            let (value, gradient) = cost.eval_with_gradient(&DVector::from_vec(vec![q])).unwrap();
            let theta: f64 = q - 0.5;
            assert!((value - 3.0 * (1.0 - theta.cos())).abs() < 1e-12);
            assert!((gradient[0] - 3.0 * theta.sin()).abs() < 1e-12);
        }
    }
}
