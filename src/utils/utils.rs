//! Helper functions

use crate::autodiff::IkScalar;
use nalgebra::{DVector, Matrix3, Vector3, SVD};

/// Checks if all elements are finite
pub fn is_valid(qs: &DVector<f64>) -> bool {
    qs.iter().all(|q| q.is_finite())
}

/// Rotation by `angle` about the unit `axis` (Rodrigues formula).
pub fn rotation_about_axis<T: IkScalar>(axis: &Vector3<f64>, angle: &T) -> Matrix3<T> {
    let c = angle.cos();
    let s = angle.sin();
    let one_minus_c = T::one() - c.clone();
    let k = |v: f64| T::from_f64(v);
    let (x, y, z) = (axis.x, axis.y, axis.z);
    Matrix3::new(
        c.clone() + one_minus_c.clone() * k(x * x),
        one_minus_c.clone() * k(x * y) - s.clone() * k(z),
        one_minus_c.clone() * k(x * z) + s.clone() * k(y),
        one_minus_c.clone() * k(y * x) + s.clone() * k(z),
        c.clone() + one_minus_c.clone() * k(y * y),
        one_minus_c.clone() * k(y * z) - s.clone() * k(x),
        one_minus_c.clone() * k(z * x) - s.clone() * k(y),
        one_minus_c.clone() * k(z * y) + s.clone() * k(x),
        c + one_minus_c * k(z * z),
    )
}

/// Rotation matrix of the quaternion `(w, x, y, z)`. The quaternion does not need to be
/// normalized, a zero quaternion gives identity.
pub fn rotation_from_quaternion<T: IkScalar>(w: &T, x: &T, y: &T, z: &T) -> Matrix3<T> {
    let (w, x, y, z) = (w.clone(), x.clone(), y.clone(), z.clone());
    let s = w.clone() * w.clone() + x.clone() * x.clone() + y.clone() * y.clone() + z.clone() * z.clone();
    if s.value() <= f64::EPSILON {
        return Matrix3::identity();
    }
    let two = T::from_f64(2.0);
    let m = Matrix3::new(
        w.clone() * w.clone() + x.clone() * x.clone() - y.clone() * y.clone() - z.clone() * z.clone(),
        two.clone() * (x.clone() * y.clone() - w.clone() * z.clone()),
        two.clone() * (x.clone() * z.clone() + w.clone() * y.clone()),
        two.clone() * (x.clone() * y.clone() + w.clone() * z.clone()),
        w.clone() * w.clone() - x.clone() * x.clone() + y.clone() * y.clone() - z.clone() * z.clone(),
        two.clone() * (y.clone() * z.clone() - w.clone() * x.clone()),
        two.clone() * (x.clone() * z.clone() - w.clone() * y.clone()),
        two.clone() * (y.clone() * z.clone() + w.clone() * x.clone()),
        w.clone() * w - x.clone() * x - y.clone() * y + z.clone() * z,
    );
    m.map(|e| e / s.clone())
}

pub fn dot<T: IkScalar>(a: &Vector3<T>, b: &Vector3<T>) -> T {
    a[0].clone() * b[0].clone() + a[1].clone() * b[1].clone() + a[2].clone() * b[2].clone()
}

pub fn cross<T: IkScalar>(a: &Vector3<T>, b: &Vector3<T>) -> Vector3<T> {
    Vector3::new(
        a[1].clone() * b[2].clone() - a[2].clone() * b[1].clone(),
        a[2].clone() * b[0].clone() - a[0].clone() * b[2].clone(),
        a[0].clone() * b[1].clone() - a[1].clone() * b[0].clone(),
    )
}

/// Euclidean norm with a zero derivative at the origin.
pub fn norm<T: IkScalar>(v: &Vector3<T>) -> T {
    dot(v, v).sqrt()
}

pub fn trace<T: IkScalar>(m: &Matrix3<T>) -> T {
    m[(0, 0)].clone() + m[(1, 1)].clone() + m[(2, 2)].clone()
}

/// Angle in `[0, pi]` of the rotation `m`. Computed from both the symmetric and skew parts so the
/// value is accurate near 0 and pi.
pub fn rotation_angle<T: IkScalar>(m: &Matrix3<T>) -> T {
    let half = T::from_f64(0.5);
    let axis = Vector3::new(
        m[(2, 1)].clone() - m[(1, 2)].clone(),
        m[(0, 2)].clone() - m[(2, 0)].clone(),
        m[(1, 0)].clone() - m[(0, 1)].clone(),
    );
    let sin_theta = norm(&axis) * half.clone();
    let cos_theta = (trace(m) - T::one()) * half;
    sin_theta.atan2(&cos_theta)
}

/// Angle in `[0, pi]` between two vectors. Zero vectors give zero.
pub fn angle_between<T: IkScalar>(a: &Vector3<T>, b: &Vector3<T>) -> T {
    norm(&cross(a, b)).atan2(&dot(a, b))
}

/// Nearest proper rotation to `m` in the Frobenius norm.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = SVD::new(*m, true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut correction = Matrix3::identity();
            if (u * v_t).determinant() < 0.0 {
                correction[(2, 2)] = -1.0;
            }
            u * correction * v_t
        }
        _ => Matrix3::identity(),
    }
}

/// Print generalized positions, converting radians to degrees.
pub fn dump_positions(q: &DVector<f64>) {
    let mut row_str = String::new();
    for computed in q.iter() {
        row_str.push_str(&format!("{:5.2} ", computed.to_degrees()));
    }
    println!("[{}]", row_str.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::AutoDiff;
    use nalgebra::{Rotation3, Unit, UnitQuaternion};
    use std::f64::consts::PI;

    #[test]
    fn test_is_valid_with_nan() {
        assert!(is_valid(&DVector::from_vec(vec![0.0, 1.0, PI])));
        assert!(!is_valid(&DVector::from_vec(vec![0.0, f64::NAN])));
        assert!(!is_valid(&DVector::from_vec(vec![f64::INFINITY])));
    }

    #[test]
    fn test_rotation_about_axis_matches_nalgebra() {
        let axis = Vector3::new(1.0, -2.0, 0.5).normalize();
        let angle = 0.83;
        let expected = Rotation3::from_axis_angle(&Unit::new_normalize(axis), angle).into_inner();
        let computed = rotation_about_axis(&axis, &angle);
        assert!((computed - expected).norm() < 1e-12);
    }

    #[test]
    fn test_rotation_from_unnormalized_quaternion() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.4, 1.1);
        let expected = q.to_rotation_matrix().into_inner();
        let (w, x, y, z) = (2.0 * q.w, 2.0 * q.i, 2.0 * q.j, 2.0 * q.k);
        let computed = rotation_from_quaternion(&w, &x, &y, &z);
        assert!((computed - expected).norm() < 1e-12);
    }

    #[test]
    fn test_rotation_angle() {
        for angle in [0.0, 1e-9, 0.4, PI / 2.0, 3.0, PI] {
            let r = Rotation3::from_axis_angle(&Vector3::y_axis(), angle).into_inner();
            assert!((rotation_angle(&r) - angle).abs() < 1e-9, "Angle {} not recovered", angle);
        }
    }

    #[test]
    fn test_angle_at_identity_has_finite_gradient() {
        let x = DVector::from_vec(vec![0.0]);
        let t = &AutoDiff::seed(&x)[0];
        let r = rotation_about_axis(&Vector3::z(), t);
        let angle = rotation_angle(&r);
        assert_eq!(angle.value(), 0.0);
        assert!(angle.gradient(1)[0].is_finite());
    }

    #[test]
    fn test_nearest_rotation_fixes_reflection() {
        let mut m = Rotation3::from_euler_angles(0.2, 0.1, -0.4).into_inner();
        m.column_mut(2).neg_mut();
        let r = nearest_rotation(&m);
        assert!((r.determinant() - 1.0).abs() < 1e-9);
        assert!((r.transpose() * r - Matrix3::identity()).norm() < 1e-9);
    }
}
