//! Constraint interface shared by every kinematic and algebraic constraint.
//!
//! A constraint maps its bound decision variables `x` to residuals `r(x)` that must stay within
//! `[lower_bound, upper_bound]`, row by row. Residuals are computed once, generically over
//! [`IkScalar`], so the same code gives values (`f64`) and Jacobians ([`AutoDiff`]).

use nalgebra::{DMatrix, DVector};

use crate::angle_between_vectors_constraint::AngleBetweenVectorsConstraint;
use crate::autodiff::{AutoDiff, IkScalar};
use crate::com_constraints::{ComInPolyhedronConstraint, ComPositionConstraint};
use crate::error::{check_dimension, IkError, IkResult};
use crate::gaze_target_constraint::GazeTargetConstraint;
use crate::orientation_constraint::OrientationConstraint;
use crate::point_to_point_distance_constraint::PointToPointDistanceConstraint;
use crate::polyhedron_constraint::PolyhedronConstraint;
use crate::position_constraint::PositionConstraint;
use crate::unit_quaternion_constraint::UnitQuaternionConstraint;

#[cfg(feature = "collisions")]
use crate::distance_constraints::{DistanceConstraint, MinimumDistanceConstraint};

/// Validated residual bounds, `lower[i] <= upper[i]` for every row.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintBounds {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl ConstraintBounds {
    pub fn new(what: &str, lower: DVector<f64>, upper: DVector<f64>) -> IkResult<Self> {
        check_dimension(what, lower.len(), upper.len())?;
        check_ordered(what, &lower, &upper)?;
        Ok(ConstraintBounds { lower, upper })
    }

    /// Equality bounds, both sides at `value`.
    pub fn equality(value: DVector<f64>) -> Self {
        ConstraintBounds { lower: value.clone(), upper: value }
    }

    /// `lower <= r` with no upper bound.
    pub fn at_least(lower: DVector<f64>) -> Self {
        let upper = DVector::from_element(lower.len(), f64::INFINITY);
        ConstraintBounds { lower, upper }
    }

    /// `r <= upper` with no lower bound.
    pub fn at_most(upper: DVector<f64>) -> Self {
        let lower = DVector::from_element(upper.len(), f64::NEG_INFINITY);
        ConstraintBounds { lower, upper }
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// Replaces both sides. The number of rows cannot change.
    pub fn set(&mut self, what: &str, lower: &DVector<f64>, upper: &DVector<f64>) -> IkResult<()> {
        check_dimension(what, self.len(), lower.len())?;
        check_dimension(what, self.len(), upper.len())?;
        check_ordered(what, lower, upper)?;
        self.lower.copy_from(lower);
        self.upper.copy_from(upper);
        Ok(())
    }

    pub fn set_lower(&mut self, what: &str, lower: &DVector<f64>) -> IkResult<()> {
        let upper = self.upper.clone();
        self.set(what, lower, &upper)
    }

    pub fn set_upper(&mut self, what: &str, upper: &DVector<f64>) -> IkResult<()> {
        let lower = self.lower.clone();
        self.set(what, &lower, upper)
    }

    /// Distance of each residual to its interval, zero inside. A NaN residual is infinitely far.
    pub fn violation(&self, r: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            r.len(),
            r.iter().enumerate().map(|(i, &value)| {
                if value.is_nan() {
                    return f64::INFINITY;
                }
                (self.lower[i] - value).max(value - self.upper[i]).max(0.0)
            }),
        )
    }
}

fn check_ordered(what: &str, lower: &DVector<f64>, upper: &DVector<f64>) -> IkResult<()> {
    for i in 0..lower.len() {
        if lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i] {
            return Err(IkError::InvalidBounds {
                what: what.to_string(),
                index: i,
                lower: lower[i],
                upper: upper[i],
            });
        }
    }
    Ok(())
}

/// Residual function with bounds over a fixed number of decision variables.
pub trait Constraint {
    /// Short name used in logs and error messages.
    fn description(&self) -> &'static str;

    fn num_vars(&self) -> usize;

    fn bounds(&self) -> &ConstraintBounds;

    /// Residuals at `x`. Callers go through [`Constraint::eval`], which checks the size of `x`.
    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>>;

    fn num_outputs(&self) -> usize {
        self.bounds().len()
    }

    fn lower_bound(&self) -> &DVector<f64> {
        self.bounds().lower()
    }

    fn upper_bound(&self) -> &DVector<f64> {
        self.bounds().upper()
    }

    fn eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        check_dimension(self.description(), self.num_vars(), x.len())?;
        let r = self.do_eval(x)?;
        check_dimension(self.description(), self.num_outputs(), r.len())?;
        Ok(r)
    }

    fn eval_values(&self, x: &DVector<f64>) -> IkResult<DVector<f64>> {
        Ok(DVector::from_vec(self.eval(x.as_slice())?))
    }

    /// Residuals and their Jacobian (rows are residuals, columns are variables).
    fn eval_with_gradient(&self, x: &DVector<f64>) -> IkResult<(DVector<f64>, DMatrix<f64>)> {
        let outputs = self.eval(&AutoDiff::seed(x))?;
        let values = DVector::from_iterator(outputs.len(), outputs.iter().map(|o| o.value()));
        Ok((values, AutoDiff::jacobian(&outputs, x.len())))
    }

    fn violation(&self, x: &DVector<f64>) -> IkResult<DVector<f64>> {
        Ok(self.bounds().violation(&self.eval_values(x)?))
    }

    fn check_satisfied(&self, x: &DVector<f64>, tolerance: f64) -> IkResult<bool> {
        Ok(self.violation(x)?.iter().all(|v| *v <= tolerance))
    }
}

/// Every constraint type the library can put in a program.
#[derive(Clone, Debug)]
pub enum IkConstraint {
    Position(PositionConstraint),
    Orientation(OrientationConstraint),
    AngleBetweenVectors(AngleBetweenVectorsConstraint),
    GazeTarget(GazeTargetConstraint),
    #[cfg(feature = "collisions")]
    MinimumDistance(MinimumDistanceConstraint),
    #[cfg(feature = "collisions")]
    Distance(DistanceConstraint),
    PointToPointDistance(PointToPointDistanceConstraint),
    Polyhedron(PolyhedronConstraint),
    ComPosition(ComPositionConstraint),
    ComInPolyhedron(ComInPolyhedronConstraint),
    UnitQuaternion(UnitQuaternionConstraint),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            IkConstraint::Position($c) => $body,
            IkConstraint::Orientation($c) => $body,
            IkConstraint::AngleBetweenVectors($c) => $body,
            IkConstraint::GazeTarget($c) => $body,
            #[cfg(feature = "collisions")]
            IkConstraint::MinimumDistance($c) => $body,
            #[cfg(feature = "collisions")]
            IkConstraint::Distance($c) => $body,
            IkConstraint::PointToPointDistance($c) => $body,
            IkConstraint::Polyhedron($c) => $body,
            IkConstraint::ComPosition($c) => $body,
            IkConstraint::ComInPolyhedron($c) => $body,
            IkConstraint::UnitQuaternion($c) => $body,
        }
    };
}

impl Constraint for IkConstraint {
    fn description(&self) -> &'static str {
        dispatch!(self, c => c.description())
    }

    fn num_vars(&self) -> usize {
        dispatch!(self, c => c.num_vars())
    }

    fn bounds(&self) -> &ConstraintBounds {
        dispatch!(self, c => c.bounds())
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        dispatch!(self, c => c.do_eval(x))
    }

    fn violation(&self, x: &DVector<f64>) -> IkResult<DVector<f64>> {
        dispatch!(self, c => c.violation(x))
    }
}

/// A concrete constraint type that can be stored in and recovered from an [`IkConstraint`].
/// Typed bindings use it to hand back the concrete constraint for bound updates.
pub trait ConstraintVariant: Constraint + Sized {
    fn into_constraint(self) -> IkConstraint;
    fn from_constraint(constraint: &IkConstraint) -> Option<&Self>;
    fn from_constraint_mut(constraint: &mut IkConstraint) -> Option<&mut Self>;
}

impl ConstraintVariant for IkConstraint {
    fn into_constraint(self) -> IkConstraint {
        self
    }

    fn from_constraint(constraint: &IkConstraint) -> Option<&Self> {
        Some(constraint)
    }

    fn from_constraint_mut(constraint: &mut IkConstraint) -> Option<&mut Self> {
        Some(constraint)
    }
}

macro_rules! constraint_variant {
    ($type:ty, $variant:ident) => {
        impl ConstraintVariant for $type {
            fn into_constraint(self) -> IkConstraint {
                IkConstraint::$variant(self)
            }

            fn from_constraint(constraint: &IkConstraint) -> Option<&Self> {
                match constraint {
                    IkConstraint::$variant(c) => Some(c),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }

            fn from_constraint_mut(constraint: &mut IkConstraint) -> Option<&mut Self> {
                match constraint {
                    IkConstraint::$variant(c) => Some(c),
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }

        impl From<$type> for IkConstraint {
            fn from(constraint: $type) -> Self {
                IkConstraint::$variant(constraint)
            }
        }
    };
}

constraint_variant!(PositionConstraint, Position);
constraint_variant!(OrientationConstraint, Orientation);
constraint_variant!(AngleBetweenVectorsConstraint, AngleBetweenVectors);
constraint_variant!(GazeTargetConstraint, GazeTarget);
#[cfg(feature = "collisions")]
constraint_variant!(MinimumDistanceConstraint, MinimumDistance);
#[cfg(feature = "collisions")]
constraint_variant!(DistanceConstraint, Distance);
constraint_variant!(PointToPointDistanceConstraint, PointToPointDistance);
constraint_variant!(PolyhedronConstraint, Polyhedron);
constraint_variant!(ComPositionConstraint, ComPosition);
constraint_variant!(ComInPolyhedronConstraint, ComInPolyhedron);
constraint_variant!(UnitQuaternionConstraint, UnitQuaternion);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_validation() {
        let lower = DVector::from_vec(vec![0.0, 1.0]);
        let upper = DVector::from_vec(vec![1.0, 0.5]);
        match ConstraintBounds::new("test", lower.clone(), upper) {
            Err(IkError::InvalidBounds { index, .. }) => assert_eq!(index, 1),
            other => panic!("Expected InvalidBounds, got {:?}", other),
        }
        assert!(ConstraintBounds::new("test", lower.clone(), DVector::zeros(3)).is_err());
        assert!(ConstraintBounds::new("test", lower.clone(), DVector::from_vec(vec![f64::NAN, 2.0])).is_err());
    }

    #[test]
    fn test_set_keeps_size() {
        let mut bounds = ConstraintBounds::equality(DVector::zeros(3));
        assert!(bounds.set_lower("test", &DVector::from_element(2, -1.0)).is_err());
        bounds.set_lower("test", &DVector::from_element(3, -1.0)).unwrap();
        assert_eq!(bounds.lower()[2], -1.0);
        assert!(bounds.set_upper("test", &DVector::from_element(3, -2.0)).is_err());
        // A failed update leaves the bounds untouched
        assert_eq!(bounds.upper()[0], 0.0);
    }

    #[test]
    fn test_violation() {
        let bounds = ConstraintBounds::new(
            "test",
            DVector::from_vec(vec![0.0, f64::NEG_INFINITY, 1.0]),
            DVector::from_vec(vec![1.0, 0.0, 1.0]),
        ).unwrap();
        let v = bounds.violation(&DVector::from_vec(vec![0.5, 2.0, 0.25]));
        assert_eq!(v[0], 0.0);
        assert_eq!(v[1], 2.0);
        assert_eq!(v[2], 0.75);
    }

    #[test]
    fn test_nan_residual_is_violated() {
        let bounds = ConstraintBounds::new(
            "test",
            DVector::from_element(2, f64::NEG_INFINITY),
            DVector::from_element(2, f64::INFINITY),
        ).unwrap();
        let v = bounds.violation(&DVector::from_vec(vec![f64::NAN, 0.0]));
        assert_eq!(v[0], f64::INFINITY);
        assert_eq!(v[1], 0.0);
    }
}
