extern crate nalgebra as na;

use na::{DVector, Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use crate::autodiff::IkScalar;

/// Pose is a rigid transform, rotation and translation.
/// ```
/// extern crate nalgebra as na;
/// use na::{Isometry3, Translation3, UnitQuaternion};
///
/// type Pose = Isometry3<f64>;
///
/// let translation = Translation3::new(1.0, 0.0, 0.0);
/// let rotation = UnitQuaternion::from_quaternion(na::Quaternion::new(1.0, 0.0, 0.0, 1.0).normalize());
/// let transform = Pose::from_parts(translation, rotation);
/// ```
pub type Pose = Isometry3<f64>;

/// Generalized positions, one entry per position coordinate of the plant.
pub type Positions = DVector<f64>;

/// Rigid transform over a generic scalar. The rotation is kept as a full matrix so that
/// derivatives flow through every entry.
#[derive(Clone, Debug, PartialEq)]
pub struct GenericPose<T: IkScalar> {
    pub rotation: Matrix3<T>,
    pub translation: Vector3<T>,
}

impl<T: IkScalar> GenericPose<T> {
    pub fn identity() -> Self {
        GenericPose { rotation: Matrix3::identity(), translation: Vector3::zeros() }
    }

    pub fn new(rotation: Matrix3<T>, translation: Vector3<T>) -> Self {
        GenericPose { rotation, translation }
    }

    /// Constant pose from a plain isometry.
    pub fn from_isometry(pose: &Pose) -> Self {
        let rotation = pose.rotation.to_rotation_matrix().into_inner();
        GenericPose {
            rotation: rotation.map(T::from_f64),
            translation: pose.translation.vector.map(T::from_f64),
        }
    }

    /// `self * other`, that is X_AC = X_AB * X_BC.
    pub fn compose(&self, other: &GenericPose<T>) -> GenericPose<T> {
        GenericPose {
            rotation: &self.rotation * &other.rotation,
            translation: &self.rotation * &other.translation + self.translation.clone(),
        }
    }

    pub fn inverse(&self) -> GenericPose<T> {
        let rotation = self.rotation.transpose();
        let translation = -(&rotation * &self.translation);
        GenericPose { rotation, translation }
    }

    /// `X_AB^-1 * X_AC` without forming the inverse explicitly.
    pub fn inverse_compose(&self, other: &GenericPose<T>) -> GenericPose<T> {
        let rt = self.rotation.transpose();
        GenericPose {
            rotation: &rt * &other.rotation,
            translation: &rt * (other.translation.clone() - self.translation.clone()),
        }
    }

    pub fn transform_point(&self, p: &Vector3<T>) -> Vector3<T> {
        &self.rotation * p + self.translation.clone()
    }

    pub fn transform_point_f64(&self, p: &Vector3<f64>) -> Vector3<T> {
        self.transform_point(&p.map(T::from_f64))
    }

    pub fn rotation_value(&self) -> Matrix3<f64> {
        self.rotation.map(|x| x.value())
    }

    pub fn translation_value(&self) -> Vector3<f64> {
        self.translation.map(|x| x.value())
    }

    /// Value part as an isometry. The rotation is assumed orthonormal, as produced by the kinematics.
    pub fn to_isometry(&self) -> Pose {
        let rotation = Rotation3::from_matrix_unchecked(self.rotation_value());
        Isometry3::from_parts(
            Translation3::from(self.translation_value()),
            UnitQuaternion::from_rotation_matrix(&rotation),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::AutoDiff;

    #[test]
    fn test_compose_matches_isometry() {
        let a = Isometry3::new(Vector3::new(0.1, -0.2, 0.3), Vector3::new(0.4, 0.1, -0.7));
        let b = Isometry3::new(Vector3::new(-1.0, 0.5, 0.0), Vector3::new(-0.2, 0.9, 0.3));
        let ga = GenericPose::<f64>::from_isometry(&a);
        let gb = GenericPose::<f64>::from_isometry(&b);

        let expected = a * b;
        let composed = ga.compose(&gb).to_isometry();
        assert!((composed.translation.vector - expected.translation.vector).norm() < 1e-12);
        assert!(composed.rotation.angle_to(&expected.rotation) < 1e-9);

        let relative = ga.inverse_compose(&gb).to_isometry();
        let expected = a.inverse() * b;
        assert!((relative.translation.vector - expected.translation.vector).norm() < 1e-12);
        assert!(relative.rotation.angle_to(&expected.rotation) < 1e-9);
    }

    #[test]
    fn test_inverse_is_identity() {
        let a = Isometry3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.3, -0.1, 0.2));
        let ga = GenericPose::<AutoDiff>::from_isometry(&a);
        let id = ga.compose(&ga.inverse());
        assert!((id.rotation_value() - Matrix3::identity()).norm() < 1e-12);
        assert!(id.translation_value().norm() < 1e-12);
    }
}
