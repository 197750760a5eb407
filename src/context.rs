//! Evaluation state of a plant: generalized positions plus a cache of body poses.

use std::sync::{Arc, Mutex, MutexGuard};

use nalgebra::DVector;

use crate::error::{check_dimension, IkError, IkResult};
use crate::kinematic_traits::GenericPose;
use crate::plant::{MultibodyPlant, PlantId};

/// Context shared by the constraints and costs of one session. Each evaluation locks it for its
/// whole duration, so evaluations against the same context never interleave.
pub type SharedContext = Arc<Mutex<Context>>;

#[derive(Clone, Debug)]
pub struct Context {
    plant_id: PlantId,
    positions: DVector<f64>,
    /// Body poses at `positions`, filled lazily by plain value evaluations.
    body_poses: Option<Vec<GenericPose<f64>>>,
}

impl Context {
    pub fn plant_id(&self) -> PlantId {
        self.plant_id
    }

    pub fn positions(&self) -> &DVector<f64> {
        &self.positions
    }

    pub fn set_positions(&mut self, q: &DVector<f64>) -> IkResult<()> {
        check_dimension("context positions", self.positions.len(), q.len())?;
        if self.positions != *q {
            self.positions.copy_from(q);
            self.body_poses = None;
        }
        Ok(())
    }

    /// Stores the value of `q` without touching the cache when nothing changed.
    pub(crate) fn set_positions_from_slice(&mut self, q: &[f64]) -> IkResult<()> {
        check_dimension("context positions", self.positions.len(), q.len())?;
        if self.positions.as_slice() != q {
            self.positions.copy_from_slice(q);
            self.body_poses = None;
        }
        Ok(())
    }

    /// Body poses at the stored positions, computed once per distinct `q`.
    pub(crate) fn body_poses(&mut self, plant: &MultibodyPlant) -> IkResult<&[GenericPose<f64>]> {
        self.check_plant(plant)?;
        if self.body_poses.is_none() {
            self.body_poses = Some(plant.calc_body_poses(self.positions.as_slice())?);
        }
        Ok(self.body_poses.as_deref().unwrap_or(&[]))
    }

    pub fn is_cached(&self) -> bool {
        self.body_poses.is_some()
    }

    pub fn check_plant(&self, plant: &MultibodyPlant) -> IkResult<()> {
        if self.plant_id != plant.id() {
            return Err(IkError::ContextMismatch);
        }
        Ok(())
    }
}

impl MultibodyPlant {
    /// Context at the plant's default positions.
    pub fn create_default_context(&self) -> Context {
        Context { plant_id: self.id(), positions: self.default_positions(), body_poses: None }
    }

    pub fn create_shared_context(&self) -> SharedContext {
        Arc::new(Mutex::new(self.create_default_context()))
    }
}

/// Locks the context for one evaluation.
pub(crate) fn lock(context: &SharedContext) -> IkResult<MutexGuard<'_, Context>> {
    context.lock().map_err(|_| IkError::ContextPoisoned)
}

/// Checks that `context` was created for `plant`. Used by every constructor taking both.
pub fn check_context(plant: &MultibodyPlant, context: &SharedContext) -> IkResult<()> {
    lock(context)?.check_plant(plant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{Isometry3, Vector3};

    fn slider() -> MultibodyPlant {
        let mut builder = MultibodyPlantBuilder::new();
        let b = builder.add_rigid_body("slider", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
        builder.add_joint("x", JointType::Prismatic { axis: Vector3::x_axis() },
                          WORLD_BODY, Isometry3::identity(), b, Some((-1.0, 1.0)));
        builder.build().unwrap()
    }

    #[test]
    fn test_cache_invalidation() {
        let plant = slider();
        let mut context = plant.create_default_context();
        assert!(!context.is_cached());
        let x = context.body_poses(&plant).unwrap()[1].translation_value().x;
        assert_eq!(x, 0.0);
        assert!(context.is_cached());

        context.set_positions(&DVector::from_vec(vec![0.5])).unwrap();
        assert!(!context.is_cached());
        let x = context.body_poses(&plant).unwrap()[1].translation_value().x;
        assert_eq!(x, 0.5);

        // Same value keeps the cache
        context.set_positions(&DVector::from_vec(vec![0.5])).unwrap();
        assert!(context.is_cached());
    }

    #[test]
    fn test_wrong_plant_or_size() {
        let plant = slider();
        let other = slider();
        let context = other.create_shared_context();
        assert!(matches!(check_context(&plant, &context), Err(IkError::ContextMismatch)));

        let mut context = plant.create_default_context();
        assert!(context.set_positions(&DVector::zeros(3)).is_err());
    }
}
