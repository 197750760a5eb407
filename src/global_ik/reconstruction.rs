//! Recovering generalized positions from per-body poses that need not be exact rigid transforms.
//!
//! The tree is walked from the world: each joint takes the closest position that maps its parent's
//! reconstructed pose to the child's target, then a damped Gauss-Newton pass over all positions
//! reduces the summed error against every target at once.

use nalgebra::{DVector, Matrix3, Rotation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::autodiff::{AutoDiff, IkScalar};
use crate::error::{check_dimension, IkError, IkResult};
use crate::jacobian::damped_least_squares;
use crate::plant::{JointType, MultibodyPlant};
use crate::utils::nearest_rotation;

/// Tuning of [`reconstruct`]. Errors are Frobenius norms for rotations and meters for positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionSettings {
    pub max_iterations: usize,
    pub initial_damping: f64,
    /// Both errors below this: [`ReconstructionQuality::Exact`].
    pub exact_tolerance: f64,
    /// Either error above its limit: [`ReconstructionQuality::PoorFit`].
    pub poor_fit_rotation_error: f64,
    pub poor_fit_position_error: f64,
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        ReconstructionSettings {
            max_iterations: 100,
            initial_damping: 1e-6,
            exact_tolerance: 1e-6,
            poor_fit_rotation_error: 0.3,
            poor_fit_position_error: 0.05,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconstructionQuality {
    /// The targets are reproduced exactly.
    Exact,
    Approximate,
    /// The targets are far from any configuration of the plant. The relaxation was likely loose.
    PoorFit,
}

#[derive(Clone, Debug)]
pub struct Reconstruction {
    pub q: DVector<f64>,
    pub max_rotation_error: f64,
    pub max_position_error: f64,
    pub quality: ReconstructionQuality,
}

/// Target pose of one body: rotation (possibly not orthonormal) and position, both in world.
pub type BodyTarget = (Matrix3<f64>, Vector3<f64>);

/// Angle θ maximizing `tr(Rot(a, θ)ᵀ M)`.
pub fn closest_revolute_angle(axis: &Vector3<f64>, M: &Matrix3<f64>) -> f64 {
    let w = Vector3::new(M[(2, 1)] - M[(1, 2)], M[(0, 2)] - M[(2, 0)], M[(1, 0)] - M[(0, 1)]);
    let aMa = (axis.transpose() * M * axis)[0];
    axis.dot(&w).atan2(M.trace() - aMa)
}

/// Moves `angle` by whole turns into `[lower, upper]` when possible, clamps otherwise.
fn into_limits(angle: f64, lower: f64, upper: f64) -> f64 {
    let turn = 2.0 * std::f64::consts::PI;
    let mut candidate = angle;
    if lower.is_finite() && candidate < lower {
        candidate += ((lower - candidate) / turn).ceil() * turn;
    }
    if upper.is_finite() && candidate > upper {
        candidate -= ((candidate - upper) / turn).ceil() * turn;
    }
    if candidate >= lower && candidate <= upper {
        candidate
    } else {
        angle.clamp(lower, upper)
    }
}

/// Initial positions from a walk over the tree, one joint at a time.
fn walk_tree(plant: &MultibodyPlant, targets: &[BodyTarget]) -> DVector<f64> {
    let mut q = plant.default_positions();
    let mut poses: Vec<(Matrix3<f64>, Vector3<f64>)> = vec![(Matrix3::identity(), Vector3::zeros()); plant.num_bodies()];
    for joint in plant.joints_in_tree_order() {
        let (R_WP, p_WP) = poses[joint.parent.0];
        let R_WJ = R_WP * joint.X_PJ.rotation.to_rotation_matrix().into_inner();
        let p_WJ = p_WP + R_WP * joint.X_PJ.translation.vector;
        let (R_target, p_target) = &targets[joint.child.0];
        let s = joint.position_start;
        poses[joint.child.0] = match &joint.joint_type {
            JointType::Revolute { axis } => {
                let M = R_WJ.transpose() * R_target;
                let angle = closest_revolute_angle(&axis.into_inner(), &M);
                q[s] = into_limits(angle, joint.lower_limits[0], joint.upper_limits[0]);
                let R_JC = Rotation3::from_axis_angle(axis, q[s]).into_inner();
                (R_WJ * R_JC, p_WJ)
            }
            JointType::Prismatic { axis } => {
                let d = axis.dot(&(R_WJ.transpose() * (p_target - p_WJ)));
                q[s] = d.clamp(joint.lower_limits[0], joint.upper_limits[0]);
                (R_WJ, p_WJ + R_WJ * axis.into_inner() * q[s])
            }
            JointType::QuaternionFloating => {
                let R_JC = nearest_rotation(&(R_WJ.transpose() * R_target));
                let quaternion = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(R_JC));
                let p_JC = R_WJ.transpose() * (p_target - p_WJ);
                q[s] = quaternion.w;
                q[s + 1] = quaternion.i;
                q[s + 2] = quaternion.j;
                q[s + 3] = quaternion.k;
                q[s + 4] = p_JC.x;
                q[s + 5] = p_JC.y;
                q[s + 6] = p_JC.z;
                (R_WJ * R_JC, *p_target)
            }
            JointType::Fixed => (R_WJ, p_WJ),
        };
    }
    q
}

/// Stacked differences between the body poses at `q` and the targets, world body excluded.
fn pose_residuals<T: IkScalar>(plant: &MultibodyPlant, targets: &[BodyTarget], q: &[T]) -> IkResult<Vec<T>> {
    let poses = plant.calc_body_poses(q)?;
    let mut residuals = Vec::with_capacity(12 * poses.len());
    for (pose, (R_target, p_target)) in poses.iter().zip(targets).skip(1) {
        for i in 0..3 {
            for j in 0..3 {
                residuals.push(pose.rotation[(i, j)].clone() - T::from_f64(R_target[(i, j)]));
            }
        }
        for i in 0..3 {
            residuals.push(pose.translation[i].clone() - T::from_f64(p_target[i]));
        }
    }
    Ok(residuals)
}

/// Normalizes quaternion blocks and clamps into the joint limits.
fn project(plant: &MultibodyPlant, q: &mut DVector<f64>) {
    for joint in plant.quaternion_floating_joints() {
        let s = joint.position_start;
        let norm = q.rows(s, 4).norm();
        if norm > f64::EPSILON {
            q.rows_mut(s, 4).unscale_mut(norm);
        } else {
            q.rows_mut(s, 4).copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
        }
    }
    let lower = plant.position_lower_limits();
    let upper = plant.position_upper_limits();
    for i in 0..q.len() {
        q[i] = q[i].clamp(lower[i], upper[i]);
    }
}

fn squared_error(plant: &MultibodyPlant, targets: &[BodyTarget], q: &DVector<f64>) -> IkResult<f64> {
    Ok(pose_residuals(plant, targets, q.as_slice())?.iter().map(|r| r * r).sum())
}

fn refine(plant: &MultibodyPlant, targets: &[BodyTarget], mut q: DVector<f64>, settings: &ReconstructionSettings) -> IkResult<DVector<f64>> {
    let n = q.len();
    let mut damping = settings.initial_damping;
    let mut error = squared_error(plant, targets, &q)?;
    for iteration in 0..settings.max_iterations {
        if error <= settings.exact_tolerance * settings.exact_tolerance {
            break;
        }
        let residuals = pose_residuals(plant, targets, &AutoDiff::seed(&q))?;
        let r = DVector::from_iterator(residuals.len(), residuals.iter().map(|x| x.value()));
        let J = AutoDiff::jacobian(&residuals, n);
        let step = damped_least_squares(&J, &(-r), damping).map_err(|e| IkError::Solver(e.to_string()))?;
        if step.norm() < 1e-12 {
            break;
        }
        let mut candidate = &q + step;
        project(plant, &mut candidate);
        let candidate_error = squared_error(plant, targets, &candidate)?;
        if candidate_error < error {
            q = candidate;
            error = candidate_error;
            damping = (damping * 0.5).max(1e-12);
        } else {
            damping *= 10.0;
            if damping > 1e6 {
                debug!("Reconstruction refinement stalled after {} iterations", iteration);
                break;
            }
        }
    }
    Ok(q)
}

/// Generalized positions whose body poses best match `targets`, one per body in index order.
pub fn reconstruct(plant: &MultibodyPlant, targets: &[BodyTarget], settings: &ReconstructionSettings) -> IkResult<Reconstruction> {
    check_dimension("body targets", plant.num_bodies(), targets.len())?;
    let initial = walk_tree(plant, targets);
    let q = refine(plant, targets, initial, settings)?;

    let poses = plant.calc_body_poses(q.as_slice())?;
    let mut max_rotation_error: f64 = 0.0;
    let mut max_position_error: f64 = 0.0;
    for (pose, (R_target, p_target)) in poses.iter().zip(targets).skip(1) {
        max_rotation_error = max_rotation_error.max((pose.rotation - R_target).norm());
        max_position_error = max_position_error.max((pose.translation - p_target).norm());
    }
    let quality = if max_rotation_error <= settings.exact_tolerance && max_position_error <= settings.exact_tolerance {
        ReconstructionQuality::Exact
    } else if max_rotation_error > settings.poor_fit_rotation_error || max_position_error > settings.poor_fit_position_error {
        warn!(
            "Poor reconstruction: rotation error {:.4}, position error {:.4}. Consider more intervals per half axis.",
            max_rotation_error, max_position_error
        );
        ReconstructionQuality::PoorFit
    } else {
        ReconstructionQuality::Approximate
    };
    Ok(Reconstruction { q, max_rotation_error, max_position_error, quality })
}
