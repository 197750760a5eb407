//! Scalar types used by the kinematics and by every constraint and cost.
//!
//! All kinematic code is written once against [`IkScalar`]. Plain `f64` gives values only,
//! [`AutoDiff`] carries the derivative with respect to the decision variables along with the value
//! (forward mode), so the same code yields constraint Jacobians.

use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

/// Squared norms below this are treated as zero when the derivative would be singular.
const DEGENERATE: f64 = 1e-300;

/// Numeric type the kinematics can be evaluated with.
pub trait IkScalar:
    nalgebra::Scalar
    + Zero
    + One
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
{
    /// True for the value-only scalar, allowing the pose cache in the context to be used.
    const IS_PLAIN: bool;

    fn from_f64(value: f64) -> Self;

    /// The value part, dropping any derivative information.
    fn value(&self) -> f64;

    fn sin(&self) -> Self;
    fn cos(&self) -> Self;

    /// Square root with a zero derivative at (and below) zero.
    fn sqrt(&self) -> Self;

    /// Four-quadrant arc tangent of `self / x`, zero derivative at the origin.
    fn atan2(&self, x: &Self) -> Self;

    fn exp(&self) -> Self;

    fn scale(&self, factor: f64) -> Self {
        self.clone() * Self::from_f64(factor)
    }
}

impl IkScalar for f64 {
    const IS_PLAIN: bool = true;

    #[inline]
    fn from_f64(value: f64) -> Self {
        value
    }

    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn sin(&self) -> Self {
        f64::sin(*self)
    }

    #[inline]
    fn cos(&self) -> Self {
        f64::cos(*self)
    }

    #[inline]
    fn sqrt(&self) -> Self {
        f64::sqrt(self.max(0.0))
    }

    #[inline]
    fn atan2(&self, x: &Self) -> Self {
        f64::atan2(*self, *x)
    }

    #[inline]
    fn exp(&self) -> Self {
        f64::exp(*self)
    }
}

/// Forward mode dual number: a value and its gradient with respect to the seeded variables.
///
/// Constants carry an empty gradient and combine with gradients of any length.
#[derive(Clone, Debug, PartialEq)]
pub struct AutoDiff {
    value: f64,
    derivatives: DVector<f64>,
}

impl AutoDiff {
    /// A constant (zero derivative).
    pub fn constant(value: f64) -> Self {
        AutoDiff { value, derivatives: DVector::zeros(0) }
    }

    /// Independent variable number `index` out of `n`.
    pub fn variable(value: f64, index: usize, n: usize) -> Self {
        let mut derivatives = DVector::zeros(n);
        derivatives[index] = 1.0;
        AutoDiff { value, derivatives }
    }

    pub fn new(value: f64, derivatives: DVector<f64>) -> Self {
        AutoDiff { value, derivatives }
    }

    /// Seeds every entry of `x` as an independent variable.
    pub fn seed(x: &DVector<f64>) -> Vec<AutoDiff> {
        let n = x.len();
        x.iter().enumerate().map(|(i, v)| AutoDiff::variable(*v, i, n)).collect()
    }

    pub fn derivatives(&self) -> &DVector<f64> {
        &self.derivatives
    }

    /// Gradient of length `n`, zero filled for constants.
    pub fn gradient(&self, n: usize) -> DVector<f64> {
        if self.derivatives.len() == n {
            self.derivatives.clone()
        } else {
            DVector::zeros(n)
        }
    }

    /// Stacks the gradients of `outputs` as rows of an `outputs.len() x n` Jacobian.
    pub fn jacobian(outputs: &[AutoDiff], n: usize) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(outputs.len(), n);
        for (row, output) in outputs.iter().enumerate() {
            if output.derivatives.len() == n {
                jacobian.row_mut(row).copy_from(&output.derivatives.transpose());
            }
        }
        jacobian
    }

    fn chain(&self, value: f64, slope: f64) -> Self {
        AutoDiff { value, derivatives: &self.derivatives * slope }
    }

    fn zero_slope(&self, value: f64) -> Self {
        AutoDiff { value, derivatives: DVector::zeros(self.derivatives.len()) }
    }
}

/// `ca * a + cb * b` where either gradient may be empty.
fn combine(a: &DVector<f64>, ca: f64, b: &DVector<f64>, cb: f64) -> DVector<f64> {
    match (a.len(), b.len()) {
        (0, 0) => DVector::zeros(0),
        (0, _) => b * cb,
        (_, 0) => a * ca,
        _ => a * ca + b * cb,
    }
}

impl Add for AutoDiff {
    type Output = AutoDiff;

    fn add(self, rhs: AutoDiff) -> AutoDiff {
        AutoDiff {
            value: self.value + rhs.value,
            derivatives: combine(&self.derivatives, 1.0, &rhs.derivatives, 1.0),
        }
    }
}

impl Sub for AutoDiff {
    type Output = AutoDiff;

    fn sub(self, rhs: AutoDiff) -> AutoDiff {
        AutoDiff {
            value: self.value - rhs.value,
            derivatives: combine(&self.derivatives, 1.0, &rhs.derivatives, -1.0),
        }
    }
}

impl Mul for AutoDiff {
    type Output = AutoDiff;

    fn mul(self, rhs: AutoDiff) -> AutoDiff {
        AutoDiff {
            value: self.value * rhs.value,
            derivatives: combine(&self.derivatives, rhs.value, &rhs.derivatives, self.value),
        }
    }
}

impl Div for AutoDiff {
    type Output = AutoDiff;

    fn div(self, rhs: AutoDiff) -> AutoDiff {
        let inv = 1.0 / rhs.value;
        AutoDiff {
            value: self.value * inv,
            derivatives: combine(&self.derivatives, inv, &rhs.derivatives, -self.value * inv * inv),
        }
    }
}

impl Neg for AutoDiff {
    type Output = AutoDiff;

    fn neg(self) -> AutoDiff {
        AutoDiff { value: -self.value, derivatives: -self.derivatives }
    }
}

impl AddAssign for AutoDiff {
    fn add_assign(&mut self, rhs: AutoDiff) {
        *self = self.clone() + rhs;
    }
}

impl SubAssign for AutoDiff {
    fn sub_assign(&mut self, rhs: AutoDiff) {
        *self = self.clone() - rhs;
    }
}

impl MulAssign for AutoDiff {
    fn mul_assign(&mut self, rhs: AutoDiff) {
        *self = self.clone() * rhs;
    }
}

impl DivAssign for AutoDiff {
    fn div_assign(&mut self, rhs: AutoDiff) {
        *self = self.clone() / rhs;
    }
}

impl Zero for AutoDiff {
    fn zero() -> Self {
        AutoDiff::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        self.value == 0.0 && self.derivatives.iter().all(|d| *d == 0.0)
    }
}

impl One for AutoDiff {
    fn one() -> Self {
        AutoDiff::constant(1.0)
    }
}

impl IkScalar for AutoDiff {
    const IS_PLAIN: bool = false;

    fn from_f64(value: f64) -> Self {
        AutoDiff::constant(value)
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn sin(&self) -> Self {
        self.chain(self.value.sin(), self.value.cos())
    }

    fn cos(&self) -> Self {
        self.chain(self.value.cos(), -self.value.sin())
    }

    fn sqrt(&self) -> Self {
        if self.value <= DEGENERATE {
            return self.zero_slope(self.value.max(0.0).sqrt());
        }
        let root = self.value.sqrt();
        self.chain(root, 0.5 / root)
    }

    fn atan2(&self, x: &Self) -> Self {
        let value = self.value.atan2(x.value);
        let r2 = self.value * self.value + x.value * x.value;
        if r2 <= DEGENERATE {
            let n = self.derivatives.len().max(x.derivatives.len());
            return AutoDiff { value, derivatives: DVector::zeros(n) };
        }
        // d atan2(y, x) = (x dy - y dx) / (x^2 + y^2)
        AutoDiff {
            value,
            derivatives: combine(&self.derivatives, x.value / r2, &x.derivatives, -self.value / r2),
        }
    }

    fn exp(&self) -> Self {
        let e = self.value.exp();
        self.chain(e, e)
    }
}
