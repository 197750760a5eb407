//! Signed distance queries between the collision geometries of a plant.
//!
//! Geometry lives in `f32` (parry), kinematics in `f64`. A query is made at plain body poses; the
//! witness points it returns are then fixed to their bodies so that the distance can be re-evaluated
//! with [`IkScalar`] to obtain its derivative.

use nalgebra::{Isometry3, Vector3};
use parry3d::query;
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use crate::autodiff::IkScalar;
use crate::error::{IkError, IkResult};
use crate::kinematic_traits::GenericPose;
use crate::plant::{BodyIndex, GeometryId, MultibodyPlant};
use crate::utils::dot;

/// Geometries farther apart than this are reported at this distance.
pub const DISTANCE_QUERY_LIMIT: f64 = 1.0e3;

/// Unordered pair of geometries, stored with the smaller id first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryPair {
    pub id_a: GeometryId,
    pub id_b: GeometryId,
}

impl GeometryPair {
    pub fn new(a: GeometryId, b: GeometryId) -> Self {
        GeometryPair { id_a: a.min(b), id_b: a.max(b) }
    }
}

/// Result of a signed distance query. Witness points are expressed in the frames of the bodies
/// carrying the geometries, `normal_W` points from A to B.
#[derive(Clone, Debug)]
pub struct SignedDistancePair {
    pub pair: GeometryPair,
    pub body_a: BodyIndex,
    pub body_b: BodyIndex,
    pub distance: f64,
    pub p_ACa: Vector3<f64>,
    pub p_BCb: Vector3<f64>,
    pub normal_W: Vector3<f64>,
}

impl SignedDistancePair {
    /// Distance along the query normal between the witness points moved with the bodies.
    /// Matches [`Self::distance`] at the query configuration and carries its derivative.
    pub fn distance_at<T: IkScalar>(&self, body_poses: &[GenericPose<T>]) -> T {
        let p_WCa = body_poses[self.body_a.0].transform_point_f64(&self.p_ACa);
        let p_WCb = body_poses[self.body_b.0].transform_point_f64(&self.p_BCb);
        dot(&self.normal_W.map(T::from_f64), &(p_WCb - p_WCa))
    }

    /// True if this pair was reported at the query limit rather than measured.
    pub fn is_beyond_limit(&self) -> bool {
        self.distance >= DISTANCE_QUERY_LIMIT
    }
}

impl MultibodyPlant {
    /// Pairs of geometries whose collision matters: different bodies, not joined by a joint.
    pub fn collision_candidates(&self) -> Vec<GeometryPair> {
        let geometries = self.geometries();
        let mut pairs = Vec::with_capacity(geometries.len() * geometries.len().saturating_sub(1) / 2);
        for i in 0..geometries.len() {
            for j in (i + 1)..geometries.len() {
                let (a, b) = (geometries[i].body, geometries[j].body);
                if a != b && !self.are_adjacent(a, b) {
                    pairs.push(GeometryPair::new(GeometryId(i), GeometryId(j)));
                }
            }
        }
        pairs
    }

    /// Signed distance of one pair at the given body poses. Pairs farther than
    /// [`DISTANCE_QUERY_LIMIT`] are reported at the limit with a zero normal.
    pub fn compute_signed_distance_pair(
        &self,
        body_poses: &[Isometry3<f64>],
        pair: GeometryPair,
    ) -> IkResult<SignedDistancePair> {
        if let Some(result) = self.query_pair(body_poses, pair, DISTANCE_QUERY_LIMIT)? {
            return Ok(result);
        }
        Ok(SignedDistancePair {
            pair,
            body_a: self.geometry(pair.id_a)?.body,
            body_b: self.geometry(pair.id_b)?.body,
            distance: DISTANCE_QUERY_LIMIT,
            p_ACa: Vector3::zeros(),
            p_BCb: Vector3::zeros(),
            normal_W: Vector3::zeros(),
        })
    }

    /// All candidate pairs closer than `max_distance`, queried in parallel.
    pub fn compute_signed_distance_pairwise_closest_points(
        &self,
        body_poses: &[Isometry3<f64>],
        max_distance: f64,
    ) -> IkResult<Vec<SignedDistancePair>> {
        let candidates = self.collision_candidates();
        let results: Vec<IkResult<Option<SignedDistancePair>>> = candidates
            .par_iter()
            .map(|pair| self.query_pair(body_poses, *pair, max_distance))
            .collect();

        let mut pairs = Vec::with_capacity(4);
        for result in results {
            if let Some(pair) = result? {
                if pair.distance < max_distance {
                    pairs.push(pair);
                }
            }
        }
        Ok(pairs)
    }

    fn query_pair(
        &self,
        body_poses: &[Isometry3<f64>],
        pair: GeometryPair,
        max_distance: f64,
    ) -> IkResult<Option<SignedDistancePair>> {
        let a = self.geometry(pair.id_a)?;
        let b = self.geometry(pair.id_b)?;
        let X_WA = body_poses[a.body.0];
        let X_WB = body_poses[b.body.0];
        let X_WGa = (X_WA * a.X_BG).cast::<f32>();
        let X_WGb = (X_WB * b.X_BG).cast::<f32>();

        let contact = match query::contact(&X_WGa, &*a.shape, &X_WGb, &*b.shape, max_distance as f32) {
            Ok(contact) => contact,
            Err(_) => {
                tracing::warn!("Distance between {} and {} is not supported, pair skipped", a.name, b.name);
                return Ok(None);
            }
        };
        let Some(contact) = contact else {
            return Ok(None);
        };

        let p_WCa = contact.point1.coords.cast::<f64>();
        let p_WCb = contact.point2.coords.cast::<f64>();
        let normal_W = contact.normal1.into_inner().cast::<f64>();
        if !normal_W.iter().all(|x| x.is_finite()) {
            return Err(IkError::InvalidArgument(format!(
                "Degenerate contact normal between {} and {}",
                a.name, b.name
            )));
        }
        Ok(Some(SignedDistancePair {
            pair,
            body_a: a.body,
            body_b: b.body,
            distance: contact.dist as f64,
            p_ACa: X_WA.inverse_transform_point(&p_WCa.into()).coords,
            p_BCb: X_WB.inverse_transform_point(&p_WCb.into()).coords,
            normal_W,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::AutoDiff;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::DVector;
    use parry3d::shape::SharedShape;

    /// A fixed ball at the origin and a ball sliding along x. Both radii 0.5.
    fn two_balls() -> MultibodyPlant {
        let mut builder = MultibodyPlantBuilder::new();
        let anchor = builder.add_rigid_body("anchor", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        let slider = builder.add_rigid_body("slider", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("weld", JointType::Fixed, WORLD_BODY, Isometry3::identity(), anchor, None);
        builder.add_joint("x", JointType::Prismatic { axis: Vector3::x_axis() },
                          WORLD_BODY, Isometry3::translation(2.0, 0.0, 0.0), slider, Some((-5.0, 5.0)));
        builder.add_collision_geometry("anchor_ball", anchor, Isometry3::identity(), SharedShape::ball(0.5));
        builder.add_collision_geometry("slider_ball", slider, Isometry3::identity(), SharedShape::ball(0.5));
        builder.build().unwrap()
    }

    fn isometries(plant: &MultibodyPlant, q: f64) -> Vec<Isometry3<f64>> {
        plant.calc_body_poses(&[q]).unwrap().iter().map(|p| p.to_isometry()).collect()
    }

    #[test]
    fn test_candidates_skip_adjacent_bodies() {
        let plant = two_balls();
        // Both bodies hang from the world but not from each other
        assert_eq!(plant.collision_candidates().len(), 1);
    }

    #[test]
    fn test_distance_and_derivative() {
        let plant = two_balls();
        let pair = plant.collision_candidates()[0];
        let result = plant.compute_signed_distance_pair(&isometries(&plant, 0.25), pair).unwrap();
        assert!((result.distance - 1.25).abs() < 1e-5, "distance {}", result.distance);

        let q = DVector::from_vec(vec![0.25]);
        let poses = plant.calc_body_poses(&AutoDiff::seed(&q)).unwrap();
        let d = result.distance_at(&poses);
        assert!((d.value() - result.distance).abs() < 1e-5);
        // Sliding away increases the distance one to one
        assert!((d.gradient(1)[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_penetration_is_negative() {
        let plant = two_balls();
        let pair = plant.collision_candidates()[0];
        let result = plant.compute_signed_distance_pair(&isometries(&plant, -1.2), pair).unwrap();
        assert!((result.distance + 0.2).abs() < 1e-5, "distance {}", result.distance);
    }

    #[test]
    fn test_pairwise_filter() {
        let plant = two_balls();
        assert_eq!(plant.compute_signed_distance_pairwise_closest_points(&isometries(&plant, 0.0), 0.5).unwrap().len(), 0);
        assert_eq!(plant.compute_signed_distance_pairwise_closest_points(&isometries(&plant, 0.0), 1.5).unwrap().len(), 1);
    }
}
