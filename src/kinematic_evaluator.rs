//! Evaluates frame poses of a plant for a generic scalar, holding the shared context for the
//! duration of each call.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::autodiff::{AutoDiff, IkScalar};
use crate::context::{check_context, lock, SharedContext};
use crate::error::{check_dimension, IkResult};
use crate::kinematic_traits::{GenericPose, Pose};
use crate::plant::{FrameIndex, ModelInstanceIndex, MultibodyPlant};

/// Plant together with the context every evaluation goes through.
///
/// Plain (`f64`) evaluations reuse the body poses cached in the context when `q` did not change.
/// Differentiable evaluations recompute the poses but still record `q` in the context.
#[derive(Clone, Debug)]
pub struct KinematicEvaluator {
    plant: Arc<MultibodyPlant>,
    context: SharedContext,
}

impl KinematicEvaluator {
    /// Fails with `ContextMismatch` if the context was created for another plant.
    pub fn new(plant: Arc<MultibodyPlant>, context: SharedContext) -> IkResult<Self> {
        check_context(&plant, &context)?;
        Ok(KinematicEvaluator { plant, context })
    }

    pub fn plant(&self) -> &Arc<MultibodyPlant> {
        &self.plant
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn num_positions(&self) -> usize {
        self.plant.num_positions()
    }

    /// Runs `f` with the world poses of all bodies at `q` while the context is locked.
    pub fn with_body_poses<T, R, F>(&self, q: &[T], f: F) -> IkResult<R>
    where
        T: IkScalar,
        F: FnOnce(&[GenericPose<T>]) -> IkResult<R>,
    {
        check_dimension("generalized positions", self.plant.num_positions(), q.len())?;
        let mut context = lock(&self.context)?;
        let values: Vec<f64> = q.iter().map(|x| x.value()).collect();
        context.set_positions_from_slice(&values)?;
        if T::IS_PLAIN {
            let poses: Vec<GenericPose<T>> = context
                .body_poses(&self.plant)?
                .iter()
                .map(|p| GenericPose::new(p.rotation.map(T::from_f64), p.translation.map(T::from_f64)))
                .collect();
            f(&poses)
        } else {
            let poses = self.plant.calc_body_poses(q)?;
            f(&poses)
        }
    }

    pub fn frame_pose_in_world<T: IkScalar>(&self, q: &[T], frame: FrameIndex) -> IkResult<GenericPose<T>> {
        self.with_body_poses(q, |poses| self.plant.frame_pose_from_body_poses(poses, frame))
    }

    /// Pose of `frame_b` measured and expressed in `frame_a`.
    pub fn relative_pose<T: IkScalar>(
        &self,
        q: &[T],
        frame_a: FrameIndex,
        frame_b: FrameIndex,
    ) -> IkResult<GenericPose<T>> {
        self.with_body_poses(q, |poses| {
            let X_WA = self.plant.frame_pose_from_body_poses(poses, frame_a)?;
            let X_WB = self.plant.frame_pose_from_body_poses(poses, frame_b)?;
            Ok(X_WA.inverse_compose(&X_WB))
        })
    }

    /// Position of point Q, fixed in `frame_b` at `p_BQ`, expressed in `frame_a`.
    pub fn point_in_frame<T: IkScalar>(
        &self,
        q: &[T],
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        frame_a: FrameIndex,
    ) -> IkResult<Vector3<T>> {
        let X_AB = self.relative_pose(q, frame_a, frame_b)?;
        Ok(X_AB.transform_point_f64(p_BQ))
    }

    /// Center of mass of `instances`, expressed in `frame_e`.
    pub fn center_of_mass_in_frame<T: IkScalar>(
        &self,
        q: &[T],
        instances: &[ModelInstanceIndex],
        frame_e: FrameIndex,
    ) -> IkResult<Vector3<T>> {
        self.with_body_poses(q, |poses| {
            let p_WScm = self.plant.center_of_mass_from_body_poses(poses, instances)?;
            let X_WE = self.plant.frame_pose_from_body_poses(poses, frame_e)?;
            Ok(X_WE.rotation.transpose() * (p_WScm - X_WE.translation))
        })
    }

    /// World pose of `frame` and its 6 x n Jacobian with respect to `q`. The first three rows
    /// are the derivative of the frame origin, the last three the angular rate `w` such that
    /// `dR/dq_i = [w_i]x R`.
    pub fn frame_pose_and_jacobian(&self, q: &DVector<f64>, frame: FrameIndex) -> IkResult<(Pose, DMatrix<f64>)> {
        let n = q.len();
        let pose = self.frame_pose_in_world(&AutoDiff::seed(q), frame)?;
        let rotation = pose.rotation_value();
        let mut jacobian = DMatrix::zeros(6, n);
        for i in 0..n {
            let dp = pose.translation.map(|x| x.gradient(n)[i]);
            let dr = pose.rotation.map(|x| x.gradient(n)[i]);
            let w = dr * rotation.transpose();
            jacobian[(0, i)] = dp.x;
            jacobian[(1, i)] = dp.y;
            jacobian[(2, i)] = dp.z;
            jacobian[(3, i)] = 0.5 * (w[(2, 1)] - w[(1, 2)]);
            jacobian[(4, i)] = 0.5 * (w[(0, 2)] - w[(2, 0)]);
            jacobian[(5, i)] = 0.5 * (w[(1, 0)] - w[(0, 1)]);
        }
        Ok((pose.to_isometry(), jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::Isometry3;

    /// A single rotary joint with the tip one meter from the axis. Rotating the joint
    /// moves the tip along y and rotates it about z, both with unit rate at zero.
    fn single_rotary_joint() -> (Arc<MultibodyPlant>, FrameIndex) {
        let mut builder = MultibodyPlantBuilder::new();
        let link = builder.add_rigid_body("link", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::new(0.5, 0.0, 0.0));
        builder.add_joint("j", JointType::Revolute { axis: Vector3::z_axis() },
                          WORLD_BODY, Isometry3::identity(), link, None);
        let tip = builder.add_frame("tip", link, Isometry3::translation(1.0, 0.0, 0.0));
        (Arc::new(builder.build().unwrap()), tip)
    }

    #[test]
    fn test_jacobian_of_rotary_joint() {
        let (plant, tip) = single_rotary_joint();
        let evaluator = KinematicEvaluator::new(plant.clone(), plant.create_shared_context()).unwrap();
        let (pose, jacobian) = evaluator.frame_pose_and_jacobian(&DVector::zeros(1), tip).unwrap();
        assert!((pose.translation.vector - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
        let expected = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        for (row, value) in expected.iter().enumerate() {
            assert!((jacobian[(row, 0)] - value).abs() < 1e-12, "Row {} is {}", row, jacobian[(row, 0)]);
        }
    }

    #[test]
    fn test_plain_and_autodiff_agree() {
        let (plant, tip) = single_rotary_joint();
        let evaluator = KinematicEvaluator::new(plant.clone(), plant.create_shared_context()).unwrap();
        let q = DVector::from_vec(vec![0.7]);
        let plain = evaluator.point_in_frame(q.as_slice(), tip, &Vector3::new(0.1, 0.0, 0.0), plant.world_frame()).unwrap();
        let ad = evaluator.point_in_frame(&AutoDiff::seed(&q), tip, &Vector3::new(0.1, 0.0, 0.0), plant.world_frame()).unwrap();
        assert!((plain - ad.map(|x| x.value())).norm() < 1e-14);
        assert_eq!(lock(evaluator.context()).unwrap().positions()[0], 0.7);
    }

    #[test]
    fn test_center_of_mass_in_moving_frame() {
        let (plant, tip) = single_rotary_joint();
        let evaluator = KinematicEvaluator::new(plant.clone(), plant.create_shared_context()).unwrap();
        let com = evaluator.center_of_mass_in_frame(&[1.0], &[DEFAULT_MODEL_INSTANCE], tip).unwrap();
        assert!((com - Vector3::new(-0.5, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_foreign_context_rejected() {
        let (plant, _) = single_rotary_joint();
        let (other, _) = single_rotary_joint();
        assert!(KinematicEvaluator::new(plant, other.create_shared_context()).is_err());
    }
}
