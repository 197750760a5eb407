//! Center of mass constraints over a set of model instances.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Vector3};

use crate::autodiff::IkScalar;
use crate::constraints::{Constraint, ConstraintBounds};
use crate::context::SharedContext;
use crate::error::{check_dimension, IkError, IkResult};
use crate::kinematic_evaluator::KinematicEvaluator;
use crate::plant::{FrameIndex, ModelInstanceIndex, MultibodyPlant};
use crate::polyhedron_constraint::constant_times;

fn resolve_instances(
    plant: &MultibodyPlant,
    model_instances: Option<&[ModelInstanceIndex]>,
) -> IkResult<Vec<ModelInstanceIndex>> {
    let instances = plant.resolve_model_instances(model_instances)?;
    if plant.total_mass(&instances) <= 0.0 {
        return Err(IkError::InvalidArgument(format!(
            "Model instances {:?} have no mass, the center of mass is undefined",
            instances
        )));
    }
    Ok(instances)
}

/// Binds `[q, r]` and requires `p_EScm(q) - r = 0`, so that `r` follows the center of mass of
/// the selected model instances (all non-world instances when `None`) in frame E.
#[derive(Clone, Debug)]
pub struct ComPositionConstraint {
    evaluator: KinematicEvaluator,
    model_instances: Vec<ModelInstanceIndex>,
    expressed_frame: FrameIndex,
    bounds: ConstraintBounds,
}

impl ComPositionConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        model_instances: Option<&[ModelInstanceIndex]>,
        expressed_frame: FrameIndex,
        context: SharedContext,
    ) -> IkResult<Self> {
        let model_instances = resolve_instances(&plant, model_instances)?;
        plant.frame(expressed_frame)?;
        Ok(ComPositionConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            model_instances,
            expressed_frame,
            bounds: ConstraintBounds::equality(DVector::zeros(3)),
        })
    }

    pub fn model_instances(&self) -> &[ModelInstanceIndex] {
        &self.model_instances
    }
}

impl Constraint for ComPositionConstraint {
    fn description(&self) -> &'static str {
        "center of mass position constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions() + 3
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let nq = self.evaluator.num_positions();
        let (q, r) = x.split_at(nq);
        let p_EScm = self.evaluator.center_of_mass_in_frame(q, &self.model_instances, self.expressed_frame)?;
        let r = Vector3::new(r[0].clone(), r[1].clone(), r[2].clone());
        Ok((p_EScm - r).iter().cloned().collect())
    }
}

/// `lb <= A * p_EScm(q) <= ub` for the center of mass of the selected model instances.
#[derive(Clone, Debug)]
pub struct ComInPolyhedronConstraint {
    evaluator: KinematicEvaluator,
    model_instances: Vec<ModelInstanceIndex>,
    expressed_frame: FrameIndex,
    A: DMatrix<f64>,
    bounds: ConstraintBounds,
}

impl ComInPolyhedronConstraint {
    pub fn new(
        plant: Arc<MultibodyPlant>,
        model_instances: Option<&[ModelInstanceIndex]>,
        expressed_frame: FrameIndex,
        A: &DMatrix<f64>,
        lb: &DVector<f64>,
        ub: &DVector<f64>,
        context: SharedContext,
    ) -> IkResult<Self> {
        check_dimension("center of mass polyhedron A columns", 3, A.ncols())?;
        check_dimension("center of mass polyhedron lower bound", A.nrows(), lb.len())?;
        check_dimension("center of mass polyhedron upper bound", A.nrows(), ub.len())?;
        let model_instances = resolve_instances(&plant, model_instances)?;
        plant.frame(expressed_frame)?;
        Ok(ComInPolyhedronConstraint {
            evaluator: KinematicEvaluator::new(plant, context)?,
            model_instances,
            expressed_frame,
            A: A.clone(),
            bounds: ConstraintBounds::new("center of mass polyhedron bounds", lb.clone(), ub.clone())?,
        })
    }
}

impl Constraint for ComInPolyhedronConstraint {
    fn description(&self) -> &'static str {
        "center of mass in polyhedron constraint"
    }

    fn num_vars(&self) -> usize {
        self.evaluator.num_positions()
    }

    fn bounds(&self) -> &ConstraintBounds {
        &self.bounds
    }

    fn do_eval<T: IkScalar>(&self, x: &[T]) -> IkResult<Vec<T>> {
        let p_EScm = self.evaluator.center_of_mass_in_frame(x, &self.model_instances, self.expressed_frame)?;
        Ok(constant_times(&self.A, p_EScm.as_slice()))
    }
}
