extern crate nalgebra as na;
use na::{DMatrix, DVector, Isometry3, Vector6};
use na::linalg::SVD;
use rayon::prelude::*;
use crate::error::IkResult;
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, MultibodyPlant};

/// Struct representing the Jacobian of a frame with respect to the generalized positions
pub struct FrameJacobian {
    /// A 6 x n matrix representing the Jacobian
    ///
    /// The Jacobian matrix maps the rates of generalized positions to the frame velocities.
    /// Each column corresponds to a position coordinate, the rows are linear and then angular
    /// velocity of the frame, in world.
    matrix: DMatrix<f64>,

    /// Singular values below this are treated as zero in the pseudo-inverse
    epsilon: f64,
}

impl FrameJacobian {
    /// Constructs a new FrameJacobian by differentiating the pose of `frame` at `q`
    ///
    /// # Arguments
    ///
    /// * `evaluator` - Plant and context to evaluate with
    /// * `q` - Generalized positions
    /// * `frame` - The frame whose motion is described
    /// * `epsilon` - Singular value threshold for the pseudo-inverse
    ///
    /// # Returns
    ///
    /// A new instance of `FrameJacobian`, or the evaluation error
    pub fn new(evaluator: &KinematicEvaluator, q: &DVector<f64>, frame: FrameIndex, epsilon: f64) -> IkResult<Self> {
        let (_, matrix) = evaluator.frame_pose_and_jacobian(q, frame)?;
        Ok(Self { matrix, epsilon })
    }

    pub fn from_matrix(matrix: DMatrix<f64>, epsilon: f64) -> Self {
        Self { matrix, epsilon }
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Computes the rates of generalized positions required to achieve a desired frame velocity
    ///
    /// # Arguments
    ///
    /// * `desired_velocity` - An Isometry3 representing the desired linear and angular velocity
    ///
    /// # Returns
    ///
    /// `Result<DVector<f64>, &'static str>` - Least squares rates of generalized positions,
    /// or an error message if the pseudo-inverse cannot be computed.
    pub fn velocities(&self, desired_velocity: &Isometry3<f64>) -> Result<DVector<f64>, &'static str> {
        let linear_velocity = desired_velocity.translation.vector;
        let angular_velocity = desired_velocity.rotation.scaled_axis();

        let desired = Vector6::new(
            linear_velocity.x, linear_velocity.y, linear_velocity.z,
            angular_velocity.x, angular_velocity.y, angular_velocity.z,
        );
        self.velocities_from_vector(&desired)
    }

    /// Same as [`Self::velocities`] taking the 6D velocity vector directly
    pub fn velocities_from_vector(&self, desired_velocity: &Vector6<f64>) -> Result<DVector<f64>, &'static str> {
        let desired = DVector::from_column_slice(desired_velocity.as_slice());
        least_squares(&self.matrix, &desired, self.epsilon)
    }

    /// Generalized forces balancing a wrench (force, then torque) applied at the frame origin
    pub fn generalized_forces(&self, wrench: &Vector6<f64>) -> DVector<f64> {
        self.matrix.transpose() * DVector::from_column_slice(wrench.as_slice())
    }
}

/// Minimum norm least squares solution of `matrix * x = rhs` through the SVD pseudo-inverse
pub fn least_squares(matrix: &DMatrix<f64>, rhs: &DVector<f64>, epsilon: f64) -> Result<DVector<f64>, &'static str> {
    let svd = SVD::new(matrix.clone(), true, true);
    svd.pseudo_inverse(epsilon)
        .map(|pinv| pinv * rhs)
        .map_err(|_| "Unable to compute the pseudoinverse of the Jacobian matrix")
}

/// Damped least squares step `(JᵀJ + λI)⁻¹ Jᵀ r`, falling back to the pseudo-inverse
pub fn damped_least_squares(matrix: &DMatrix<f64>, rhs: &DVector<f64>, damping: f64) -> Result<DVector<f64>, &'static str> {
    let n = matrix.ncols();
    let normal = matrix.transpose() * matrix + DMatrix::identity(n, n) * damping;
    let gradient = matrix.transpose() * rhs;
    match normal.cholesky() {
        Some(cholesky) => Ok(cholesky.solve(&gradient)),
        None => least_squares(matrix, rhs, 1e-12),
    }
}

/// Computes the same Jacobian as [`KinematicEvaluator::frame_pose_and_jacobian`] by finite
/// differences, one column per position in parallel. Intended for cross-checking.
///
/// # Arguments
///
/// * `plant` - The plant
/// * `q` - Generalized positions
/// * `frame` - The frame whose motion is described
/// * `epsilon` - A small value used for numerical differentiation
pub fn compute_jacobian_numerically(plant: &MultibodyPlant, q: &DVector<f64>, frame: FrameIndex, epsilon: f64) -> IkResult<DMatrix<f64>> {
    let current_pose = plant.calc_frame_pose_in_world(q.as_slice(), frame)?.to_isometry();
    let current_position = current_pose.translation.vector;
    let current_orientation = current_pose.rotation;

    let columns: Vec<_> = (0..q.len()).into_par_iter().map(|i| {
        let mut perturbed_q = q.clone();
        perturbed_q[i] += epsilon;
        let perturbed_pose = plant.calc_frame_pose_in_world(perturbed_q.as_slice(), frame)?.to_isometry();

        let delta_position = (perturbed_pose.translation.vector - current_position) / epsilon;
        let delta_orientation = (perturbed_pose.rotation * current_orientation.inverse()).scaled_axis() / epsilon;
        Ok((delta_position, delta_orientation))
    }).collect::<IkResult<Vec<_>>>()?;

    let mut jacobian = DMatrix::zeros(6, q.len());
    for (i, (delta_position, delta_orientation)) in columns.into_iter().enumerate() {
        jacobian.fixed_view_mut::<3, 1>(0, i).copy_from(&delta_position);
        jacobian.fixed_view_mut::<3, 1>(3, i).copy_from(&delta_orientation);
    }
    Ok(jacobian)
}
