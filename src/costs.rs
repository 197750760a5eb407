//! Scalar costs over bound decision variables, evaluated the same way as constraints.

use nalgebra::DVector;

use crate::autodiff::{AutoDiff, IkScalar};
use crate::error::{check_dimension, IkResult};
use crate::orientation_cost::OrientationCost;
use crate::position_cost::PositionCost;

pub trait Cost {
    fn description(&self) -> &'static str;

    fn num_vars(&self) -> usize;

    /// Cost at `x`. Callers go through [`Cost::eval`], which checks the size of `x`.
    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<T>;

    fn eval<T: IkScalar>(&self, x: &[T]) -> IkResult<T> {
        check_dimension(self.description(), self.num_vars(), x.len())?;
        self.do_eval(x)
    }

    fn eval_with_gradient(&self, x: &DVector<f64>) -> IkResult<(f64, DVector<f64>)> {
        let cost = self.eval(&AutoDiff::seed(x))?;
        Ok((cost.value(), cost.gradient(x.len())))
    }
}

#[derive(Clone, Debug)]
pub enum IkCost {
    Position(PositionCost),
    Orientation(OrientationCost),
}

impl Cost for IkCost {
    fn description(&self) -> &'static str {
        match self {
            IkCost::Position(c) => c.description(),
            IkCost::Orientation(c) => c.description(),
        }
    }

    fn num_vars(&self) -> usize {
        match self {
            IkCost::Position(c) => c.num_vars(),
            IkCost::Orientation(c) => c.num_vars(),
        }
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<T> {
        match self {
            IkCost::Position(c) => c.do_eval(x),
            IkCost::Orientation(c) => c.do_eval(x),
        }
    }
}

/// A concrete cost type that can be stored in and recovered from an [`IkCost`].
pub trait CostVariant: Cost + Sized {
    fn into_cost(self) -> IkCost;
    fn from_cost(cost: &IkCost) -> Option<&Self>;
}

impl CostVariant for IkCost {
    fn into_cost(self) -> IkCost {
        self
    }

    fn from_cost(cost: &IkCost) -> Option<&Self> {
        Some(cost)
    }
}

impl CostVariant for PositionCost {
    fn into_cost(self) -> IkCost {
        IkCost::Position(self)
    }

    fn from_cost(cost: &IkCost) -> Option<&Self> {
        match cost {
            IkCost::Position(c) => Some(c),
            _ => None,
        }
    }
}

impl CostVariant for OrientationCost {
    fn into_cost(self) -> IkCost {
        IkCost::Orientation(self)
    }

    fn from_cost(cost: &IkCost) -> Option<&Self> {
        match cost {
            IkCost::Orientation(c) => Some(c),
            _ => None,
        }
    }
}
