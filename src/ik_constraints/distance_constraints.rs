//! Constraints on signed distances between collision geometries.

use std::sync::Arc;

use nalgebra::{DVector, Isometry3};
use serde::{Deserialize, Serialize};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{IkError, IkResult};
use crate::geometry::GeometryPair;
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::kinematic_traits::GenericPose;
use crate::plant::MultibodyPlant;

/// Below this magnitude the exponential penalty is zero to machine precision, and its
/// derivative would overflow.
const EXPONENTIAL_CUTOFF: f64 = 1e-2;

/// Penalty `γ(x)` applied to the scaled distance `x`, zero for `x >= 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinimumDistancePenaltyFunction {
    /// `γ(x) = x²` for `x < 0`.
    #[default]
    Quadratic,
    /// `γ(x) = -x·e^(1/x)` for `x < 0`. Smooth at zero.
    Exponential,
}

impl MinimumDistancePenaltyFunction {
    pub fn penalty<T: IkScalar>(&self, x: T) -> T {
        if x.value() >= 0.0 {
            return T::zero();
        }
        match self {
            MinimumDistancePenaltyFunction::Quadratic => x.clone() * x,
            MinimumDistancePenaltyFunction::Exponential => {
                if x.value() > -EXPONENTIAL_CUTOFF {
                    return T::zero();
                }
                let exponent = (T::one() / x.clone()).exp();
                -(x * exponent)
            }
        }
    }
}

fn poses_as_isometries<T: IkScalar>(poses: &[GenericPose<T>]) -> Vec<Isometry3<f64>> {
    poses.iter().map(|p| p.to_isometry()).collect()
}

/// Keeps every pair of collision candidates at least `minimum_distance` apart.
///
/// Pairs closer than the influence distance `d_inf = minimum_distance + influence_distance_offset`
/// contribute `γ((d - d_inf) / (d_inf - d_min))`. The sum, normalized by `γ(-1)`, is the single
/// residual and must stay within `[0, 1]`. A pair exactly at `minimum_distance` alone contributes
/// 1, so the bound is reached as soon as one pair touches the minimum. When all pairs are beyond
/// the influence distance the residual is exactly zero and flat.
#[derive(Clone, Debug)]
pub struct MinimumDistanceConstraint {
    evaluator: KinematicEvaluator,
    minimum_distance: f64,
    influence_distance: f64,
    penalty_function: MinimumDistancePenaltyFunction,
    bounds: ConstraintBounds,
}

impl MinimumDistanceConstraint {
    pub const DEFAULT_INFLUENCE_DISTANCE_OFFSET: f64 = 1.0;

    pub fn new(
        plant: Arc<MultibodyPlant>,
        minimum_distance: f64,
        context: SharedContext,
        penalty_function: MinimumDistancePenaltyFunction,
        influence_distance_offset: f64,
    ) -> IkResult<Self> {
        if !minimum_distance.is_finite() {
            return Err(IkError::InvalidArgument(format!(
                "minimum_distance must be finite, got {}",
                minimum_distance
            )));
        }
        if !(influence_distance_offset.is_finite() && influence_distance_offset > 0.0) {
            return Err(IkError::InvalidArgument(format!(
                "influence_distance_offset must be positive and finite, got {}",
                influence_distance_offset
            )));
        }
        if plant.collision_candidates().is_empty() {
            return Err(IkError::InvalidArgument(
                "The plant has no pair of collision geometries to keep apart".to_string(),
            ));
        }
        Ok(MinimumDistanceConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            minimum_distance,
            influence_distance: minimum_distance + influence_distance_offset,
            penalty_function,
            bounds: ConstraintBounds::new("minimum distance bounds", DVector::zeros(1), DVector::from_element(1, 1.0))?,
        })
    }

    pub fn minimum_distance(&self) -> f64 {
        self.minimum_distance
    }

    pub fn influence_distance(&self) -> f64 {
        self.influence_distance
    }
}

impl Constraint for MinimumDistanceConstraint {
    fn description(&self) -> &'static str {
        "minimum distance constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let plant = self.evaluator.plant();
        let scale = 1.0 / (self.influence_distance - self.minimum_distance);
        let normalization = 1.0 / self.penalty_function.penalty(-1.0);
        self.evaluator.with_body_poses(x, |poses| {
            let pairs = plant.compute_signed_distance_pairwise_closest_points(
                &poses_as_isometries(poses),
                self.influence_distance,
            )?;
            let mut sum = T::zero();
            for pair in &pairs {
                let distance = pair.distance_at(poses);
                let scaled = (distance - T::from_f64(self.influence_distance)).scale(scale);
                sum += self.penalty_function.penalty(scaled);
            }
            tracing::trace!("{} pairs within the influence distance", pairs.len());
            Ok(vec![sum.scale(normalization)])
        })
    }
}

/// Bounds the signed distance between one pair of geometries.
#[derive(Clone, Debug)]
pub struct DistanceConstraint {
    evaluator: KinematicEvaluator,
    geometry_pair: GeometryPair,
    bounds: ConstraintBounds,
}

impl DistanceConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        geometry_pair: GeometryPair,
        context: SharedContext,
        distance_lower: f64,
        distance_upper: f64,
    ) -> IkResult<Self> {
        let a = plant.geometry(geometry_pair.id_a)?;
        let b = plant.geometry(geometry_pair.id_b)?;
        if a.body == b.body {
            return Err(IkError::InvalidArgument(format!(
                "Geometries {} and {} are on the same body",
                a.name, b.name
            )));
        }
        Ok(DistanceConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            geometry_pair,
            bounds: ConstraintBounds::new(
                "distance bounds",
                DVector::from_element(1, distance_lower),
                DVector::from_element(1, distance_upper),
            )?,
        })
    }

    pub fn geometry_pair(&self) -> GeometryPair {
        self.geometry_pair
    }
}

impl Constraint for DistanceConstraint {
    fn description(&self) -> &'static str {
        "distance constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let plant = self.evaluator.plant();
        self.evaluator.with_body_poses(x, |poses| {
            let pair = plant.compute_signed_distance_pair(&poses_as_isometries(poses), self.geometry_pair)?;
            if pair.is_beyond_limit() {
                return Ok(vec![T::from_f64(pair.distance)]);
            }
            Ok(vec![pair.distance_at(poses)])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{GeometryId, JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::Vector3;
    use parry3d::shape::SharedShape;

    /// Ball of radius 0.5 fixed at the origin, another sliding along x from x = 2.
    fn two_balls() -> Arc<MultibodyPlant> {
        let mut builder = MultibodyPlantBuilder::new();
        let anchor = builder.add_rigid_body("anchor", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        let slider = builder.add_rigid_body("slider", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("weld", JointType::Fixed, WORLD_BODY, Isometry3::identity(), anchor, None);
        builder.add_joint("x", JointType::Prismatic { axis: Vector3::x_axis() },
                          WORLD_BODY, Isometry3::translation(2.0, 0.0, 0.0), slider, Some((-5.0, 5.0)));
        builder.add_collision_geometry("anchor_ball", anchor, Isometry3::identity(), SharedShape::ball(0.5));
        builder.add_collision_geometry("slider_ball", slider, Isometry3::identity(), SharedShape::ball(0.5));
        Arc::new(builder.build().unwrap())
    }

    fn minimum_distance(plant: &Arc<MultibodyPlant>, penalty: MinimumDistancePenaltyFunction) -> MinimumDistanceConstraint {
        MinimumDistanceConstraint::new(plant.clone(), 0.1, plant.create_shared_context(), penalty, 0.5).unwrap()
    }

    #[test]
    fn test_flat_beyond_influence_distance() {
        let plant = two_balls();
        for penalty in [MinimumDistancePenaltyFunction::Quadratic, MinimumDistancePenaltyFunction::Exponential] {
            let constraint = minimum_distance(&plant, penalty);
            // Clearance 1.0 is beyond d_inf = 0.6
            let (r, jacobian) = constraint.eval_with_gradient(&DVector::zeros(1)).unwrap();
            assert_eq!(r[0], 0.0);
            assert_eq!(jacobian[(0, 0)], 0.0);
        }
    }

    #[test]
    fn test_unit_residual_at_minimum_distance() {
        let plant = two_balls();
        for penalty in [MinimumDistancePenaltyFunction::Quadratic, MinimumDistancePenaltyFunction::Exponential] {
            let constraint = minimum_distance(&plant, penalty);
            // Centers 1.1 apart give a clearance of exactly 0.1
            let r = constraint.eval_values(&DVector::from_vec(vec![-0.9])).unwrap();
            assert!((r[0] - 1.0).abs() < 1e-5, "{:?} gave {}", penalty, r[0]);
            let inside = constraint.eval_values(&DVector::from_vec(vec![-0.7])).unwrap();
            assert!(inside[0] > 0.0 && inside[0] < 1.0);
            assert!(constraint.check_satisfied(&DVector::from_vec(vec![-0.7]), 1e-9).unwrap());
            assert!(!constraint.check_satisfied(&DVector::from_vec(vec![-0.95]), 1e-9).unwrap());
        }
    }

    #[test]
    fn test_gradient_pushes_apart() {
        let plant = two_balls();
        let constraint = minimum_distance(&plant, MinimumDistancePenaltyFunction::Quadratic);
        let q = DVector::from_vec(vec![-0.8]);
        let (r, jacobian) = constraint.eval_with_gradient(&q).unwrap();
        // Clearance 0.2, scaled x = (0.2 - 0.6) / 0.5 = -0.8
        assert!((r[0] - 0.64).abs() < 1e-5);
        // d/dq of x² with dx/dq = 2 is 2 * 2 * x
        assert!((jacobian[(0, 0)] + 3.2).abs() < 1e-4);
    }

    #[test]
    fn test_invalid_offset() {
        let plant = two_balls();
        for bad in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            let result = MinimumDistanceConstraint::new(
                plant.clone(), 0.1, plant.create_shared_context(), MinimumDistancePenaltyFunction::Quadratic, bad,
            );
            assert!(matches!(result, Err(IkError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_pair_distance() {
        let plant = two_balls();
        let pair = GeometryPair::new(GeometryId(1), GeometryId(0));
        assert_eq!(pair.id_a, GeometryId(0));
        let constraint = DistanceConstraint::new(plant.clone(), pair, plant.create_shared_context(), 0.5, 2.0).unwrap();
        let (r, jacobian) = constraint.eval_with_gradient(&DVector::from_vec(vec![-0.5])).unwrap();
        assert!((r[0] - 0.5).abs() < 1e-5);
        assert!((jacobian[(0, 0)] - 1.0).abs() < 1e-5);
        assert!(!constraint.check_satisfied(&DVector::from_vec(vec![-0.6]), 1e-3).unwrap());
    }
}
