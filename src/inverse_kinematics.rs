//! Local inverse kinematics session: a program over the generalized positions `q` of one plant,
//! with helpers that construct kinematic constraints and costs and bind them to `q`.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3xX, Rotation3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::angle_between_vectors_constraint::AngleBetweenVectorsConstraint;
use crate::com_constraints::{ComInPolyhedronConstraint, ComPositionConstraint};
use crate::context::{check_context, lock, Context, SharedContext};
use crate::error::{check_dimension, IkResult};
use crate::gaze_target_constraint::GazeTargetConstraint;
use crate::kinematic_traits::Pose;
use crate::mathematical_program::{Binding, MathematicalProgram, Variable};
use crate::orientation_constraint::OrientationConstraint;
use crate::orientation_cost::OrientationCost;
use crate::plant::{FrameIndex, ModelInstanceIndex, MultibodyPlant};
use crate::point_to_point_distance_constraint::PointToPointDistanceConstraint;
use crate::polyhedron_constraint::PolyhedronConstraint;
use crate::position_constraint::PositionConstraint;
use crate::position_cost::PositionCost;
use crate::solvers::{solve, MathematicalProgramResult, SolverOptions};
use crate::unit_quaternion_constraint::add_unit_quaternion_constraint_on_plant;

#[cfg(feature = "collisions")]
use crate::distance_constraints::{DistanceConstraint, MinimumDistanceConstraint, MinimumDistancePenaltyFunction};
#[cfg(feature = "collisions")]
use crate::geometry::GeometryPair;

/// Owns the program and the `q` variables. Every constraint and cost added here evaluates the plant
/// through the session context, which is locked for the duration of each evaluation. Sessions that
/// are solved in parallel need their own contexts.
#[derive(Debug)]
pub struct InverseKinematics {
    plant: Arc<MultibodyPlant>,
    context: SharedContext,
    prog: MathematicalProgram,
    q: Vec<Variable>,
}

impl InverseKinematics {
    /// Session with its own context at the default positions.
    pub fn new(plant: Arc<MultibodyPlant>, with_joint_limits: bool) -> IkResult<Self> {
        let context = plant.create_shared_context();
        Self::with_context(plant, context, with_joint_limits)
    }

    /// Session over an existing context, so IK can be chained with other computations on it.
    /// The initial guess is taken from the positions stored in the context.
    pub fn with_context(plant: Arc<MultibodyPlant>, context: SharedContext, with_joint_limits: bool) -> IkResult<Self> {
        check_context(&plant, &context)?;
        let mut prog = MathematicalProgram::new();
        let q = prog.new_continuous_variables(plant.num_positions(), "q");
        if with_joint_limits {
            prog.add_bounding_box_constraint(&plant.position_lower_limits(), &plant.position_upper_limits(), &q)?;
        }
        add_unit_quaternion_constraint_on_plant(&plant, &q, &mut prog)?;
        let positions = lock(&context)?.positions().clone();
        prog.set_initial_guess(&q, &positions)?;
        debug!("IK session over {} positions, joint limits {}", q.len(), with_joint_limits);
        Ok(InverseKinematics { plant, context, prog, q })
    }

    pub fn q(&self) -> &[Variable] {
        &self.q
    }

    pub fn prog(&self) -> &MathematicalProgram {
        &self.prog
    }

    pub fn get_mutable_prog(&mut self) -> &mut MathematicalProgram {
        &mut self.prog
    }

    pub fn plant(&self) -> &Arc<MultibodyPlant> {
        &self.plant
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// Exclusive access to the context. Holding the guard blocks every evaluation of this session.
    pub fn get_mutable_context(&self) -> IkResult<std::sync::MutexGuard<'_, Context>> {
        lock(&self.context)
    }

    /// `p_AQ_lower <= p_AQ <= p_AQ_upper` for the point Q fixed in frame B.
    pub fn add_position_constraint(
        &mut self,
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        frame_a: FrameIndex,
        p_AQ_lower: &Vector3<f64>,
        p_AQ_upper: &Vector3<f64>,
    ) -> IkResult<Binding<PositionConstraint>> {
        let constraint = PositionConstraint::new(
            self.plant.clone(), frame_a, p_AQ_lower, p_AQ_upper, frame_b, p_BQ, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    /// Same as [`Self::add_position_constraint`] with frame A given as `X_AbarA` from frame Abar
    /// (identity when `None`).
    pub fn add_position_constraint_in_bar_frame(
        &mut self,
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        frame_abar: FrameIndex,
        X_AbarA: Option<Pose>,
        p_AQ_lower: &Vector3<f64>,
        p_AQ_upper: &Vector3<f64>,
    ) -> IkResult<Binding<PositionConstraint>> {
        let constraint = PositionConstraint::with_bar_frame(
            self.plant.clone(), frame_abar, X_AbarA, p_AQ_lower, p_AQ_upper, frame_b, p_BQ, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    pub fn add_position_cost(
        &mut self,
        frame_a: FrameIndex,
        p_AP: &Vector3<f64>,
        frame_b: FrameIndex,
        p_BQ: &Vector3<f64>,
        C: &Matrix3<f64>,
    ) -> IkResult<Binding<PositionCost>> {
        let cost = PositionCost::new(self.plant.clone(), frame_a, p_AP, frame_b, p_BQ, C, self.context.clone())?;
        self.prog.add_cost(cost, &self.q)
    }

    /// Angle between frame A (Abar rotated by `R_AbarA`) and frame B (Bbar rotated by `R_BbarB`)
    /// within `theta_bound`, in `[0, π]`.
    pub fn add_orientation_constraint(
        &mut self,
        frame_abar: FrameIndex,
        R_AbarA: &Rotation3<f64>,
        frame_bbar: FrameIndex,
        R_BbarB: &Rotation3<f64>,
        theta_bound: f64,
    ) -> IkResult<Binding<OrientationConstraint>> {
        let constraint = OrientationConstraint::new(
            self.plant.clone(), frame_abar, R_AbarA, frame_bbar, R_BbarB, theta_bound, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    pub fn add_orientation_cost(
        &mut self,
        frame_abar: FrameIndex,
        R_AbarA: &Rotation3<f64>,
        frame_bbar: FrameIndex,
        R_BbarB: &Rotation3<f64>,
        c: f64,
    ) -> IkResult<Binding<OrientationCost>> {
        let cost = OrientationCost::new(
            self.plant.clone(), frame_abar, R_AbarA, frame_bbar, R_BbarB, c, self.context.clone(),
        )?;
        self.prog.add_cost(cost, &self.q)
    }

    /// The target T, fixed in frame B, stays within the cone of half angle `cone_half_angle`
    /// around `n_A` with apex at S, fixed in frame A.
    pub fn add_gaze_target_constraint(
        &mut self,
        frame_a: FrameIndex,
        p_AS: &Vector3<f64>,
        n_A: &Vector3<f64>,
        frame_b: FrameIndex,
        p_BT: &Vector3<f64>,
        cone_half_angle: f64,
    ) -> IkResult<Binding<GazeTargetConstraint>> {
        let constraint = GazeTargetConstraint::new(
            self.plant.clone(), frame_a, p_AS, n_A, frame_b, p_BT, cone_half_angle, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    pub fn add_angle_between_vectors_constraint(
        &mut self,
        frame_a: FrameIndex,
        a_A: &Vector3<f64>,
        frame_b: FrameIndex,
        b_B: &Vector3<f64>,
        angle_lower: f64,
        angle_upper: f64,
    ) -> IkResult<Binding<AngleBetweenVectorsConstraint>> {
        let constraint = AngleBetweenVectorsConstraint::new(
            self.plant.clone(), frame_a, a_A, frame_b, b_B, angle_lower, angle_upper, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    /// Clearance of at least `minimum_distance` between all collision candidates, with the default
    /// quadratic penalty.
    #[cfg(feature = "collisions")]
    pub fn add_minimum_distance_constraint(
        &mut self,
        minimum_distance: f64,
        influence_distance_offset: f64,
    ) -> IkResult<Binding<MinimumDistanceConstraint>> {
        let constraint = MinimumDistanceConstraint::new(
            self.plant.clone(),
            minimum_distance,
            self.context.clone(),
            MinimumDistancePenaltyFunction::default(),
            influence_distance_offset,
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    #[cfg(feature = "collisions")]
    pub fn add_distance_constraint(
        &mut self,
        geometry_pair: GeometryPair,
        distance_lower: f64,
        distance_upper: f64,
    ) -> IkResult<Binding<DistanceConstraint>> {
        let constraint = DistanceConstraint::new(
            self.plant.clone(), geometry_pair, self.context.clone(), distance_lower, distance_upper,
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    pub fn add_point_to_point_distance_constraint(
        &mut self,
        frame1: FrameIndex,
        p_B1P1: &Vector3<f64>,
        frame2: FrameIndex,
        p_B2P2: &Vector3<f64>,
        distance_lower: f64,
        distance_upper: f64,
    ) -> IkResult<Binding<PointToPointDistanceConstraint>> {
        let constraint = PointToPointDistanceConstraint::new(
            self.plant.clone(), frame1, p_B1P1, frame2, p_B2P2, distance_lower, distance_upper, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    /// Points `p_GP` (columns), fixed in frame G, satisfy `A vec(p_FP) <= b` in frame F.
    pub fn add_polyhedron_constraint(
        &mut self,
        frame_f: FrameIndex,
        frame_g: FrameIndex,
        p_GP: &Matrix3xX<f64>,
        A: &DMatrix<f64>,
        b: &DVector<f64>,
    ) -> IkResult<Binding<PolyhedronConstraint>> {
        let constraint = PolyhedronConstraint::new(
            self.plant.clone(), frame_f, frame_g, p_GP, A, b, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    /// Adds three variables `r` tracking the center of mass in `expressed_frame`, returned with the
    /// binding. Costs and constraints on the center of mass can then be written against `r`.
    pub fn add_com_position_constraint(
        &mut self,
        model_instances: Option<&[ModelInstanceIndex]>,
        expressed_frame: FrameIndex,
    ) -> IkResult<(Binding<ComPositionConstraint>, Vec<Variable>)> {
        let constraint = ComPositionConstraint::new(
            self.plant.clone(), model_instances, expressed_frame, self.context.clone(),
        )?;
        let r = self.prog.new_continuous_variables(3, "com");
        let variables: Vec<Variable> = self.q.iter().chain(r.iter()).copied().collect();
        let binding = self.prog.add_constraint(constraint, &variables)?;
        Ok((binding, r))
    }

    pub fn add_com_in_polyhedron_constraint(
        &mut self,
        model_instances: Option<&[ModelInstanceIndex]>,
        expressed_frame: FrameIndex,
        A: &DMatrix<f64>,
        lb: &DVector<f64>,
        ub: &DVector<f64>,
    ) -> IkResult<Binding<ComInPolyhedronConstraint>> {
        let constraint = ComInPolyhedronConstraint::new(
            self.plant.clone(), model_instances, expressed_frame, A, lb, ub, self.context.clone(),
        )?;
        self.prog.add_constraint(constraint, &self.q)
    }

    /// Solves from `initial_guess` (the current program guess when `None`).
    pub fn solve(&mut self, initial_guess: Option<&DVector<f64>>, options: &SolverOptions) -> IkResult<MathematicalProgramResult> {
        if let Some(guess) = initial_guess {
            check_dimension("initial guess", self.q.len(), guess.len())?;
            self.prog.set_initial_guess(&self.q, guess)?;
        }
        let result = solve(&self.prog, options)?;
        info!("IK solved: {}", result);
        Ok(result)
    }

    /// Generalized positions of a result.
    pub fn positions(&self, result: &MathematicalProgramResult) -> DVector<f64> {
        result.get_solutions(&self.q)
    }
}

/// Builds one session per seed, each with its own context, and solves them in parallel.
/// Results are in seed order.
pub fn solve_multistart<F>(
    plant: &Arc<MultibodyPlant>,
    seeds: &[DVector<f64>],
    build: F,
    options: &SolverOptions,
) -> Vec<IkResult<(DVector<f64>, MathematicalProgramResult)>>
where
    F: Fn(&mut InverseKinematics) -> IkResult<()> + Sync,
{
    seeds
        .par_iter()
        .map(|seed| {
            let mut ik = InverseKinematics::new(plant.clone(), true)?;
            build(&mut ik)?;
            let result = ik.solve(Some(seed), options)?;
            Ok((ik.positions(&result), result))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
    use nalgebra::{Isometry3, UnitQuaternion};

    fn floating_box() -> Arc<MultibodyPlant> {
        let mut builder = MultibodyPlantBuilder::new();
        let body = builder.add_rigid_body("box", DEFAULT_MODEL_INSTANCE, 2.0, Vector3::zeros());
        builder.add_joint("free", JointType::QuaternionFloating, WORLD_BODY, Isometry3::identity(), body, None);
        Arc::new(builder.build().unwrap())
    }

    #[test]
    fn test_session_setup() {
        let plant = floating_box();
        let ik = InverseKinematics::new(plant.clone(), true).unwrap();
        assert_eq!(ik.q().len(), 7);
        assert_eq!(ik.prog().generic_constraints().len(), 1);
        assert_eq!(ik.prog().upper_bounds()[0], 1.0);
        assert_eq!(ik.prog().initial_guess()[0], 1.0);
    }

    #[test]
    fn test_context_from_other_plant_rejected() {
        let plant = floating_box();
        let other = floating_box();
        assert!(InverseKinematics::with_context(plant, other.create_shared_context(), false).is_err());
    }

    #[test]
    fn test_com_variables_bound_after_q() {
        let plant = floating_box();
        let mut ik = InverseKinematics::new(plant.clone(), false).unwrap();
        let (binding, r) = ik.add_com_position_constraint(None, plant.world_frame()).unwrap();
        assert_eq!(r.len(), 3);
        assert_eq!(binding.variables().len(), 10);
        assert_eq!(&binding.variables()[7..], &r[..]);
    }

    #[test]
    fn test_floating_body_pose() {
        let plant = floating_box();
        let body = plant.get_body_by_name("box").unwrap();
        let frame = plant.body_frame(body).unwrap();
        let mut ik = InverseKinematics::new(plant.clone(), true).unwrap();
        let target = Vector3::new(0.3, -0.2, 0.5);
        ik.add_position_constraint(frame, &Vector3::zeros(), plant.world_frame(), &target, &target).unwrap();
        let R = Rotation3::from_axis_angle(&Vector3::y_axis(), 0.4);
        ik.add_orientation_constraint(plant.world_frame(), &R, frame, &Rotation3::identity(), 0.01).unwrap();

        let options = SolverOptions { feasibility_tolerance: 1e-5, ..SolverOptions::default() };
        let result = ik.solve(None, &options).unwrap();
        assert!(result.is_success(), "{}", result);
        let q = ik.positions(&result);
        let quaternion = nalgebra::Quaternion::new(q[0], q[1], q[2], q[3]);
        assert!((quaternion.norm() - 1.0).abs() < 1e-4);
        let angle = UnitQuaternion::from_quaternion(quaternion).angle_to(&UnitQuaternion::from_rotation_matrix(&R));
        assert!(angle < 0.02);
        assert!((Vector3::new(q[4], q[5], q[6]) - target).norm() < 1e-4);
    }
}
