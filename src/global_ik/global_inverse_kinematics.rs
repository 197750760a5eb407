//! Whole-body inverse kinematics over per-body poses with a convex relaxation of SO(3).
//!
//! Every body `B` gets a 3x3 matrix of decision variables `R_WB` and a position `p_WB`. Joints become
//! linear equalities between the poses of parent and child, so the only non-convex part of the problem
//! is `R_WB ∈ SO(3)`. That set is replaced by the mixed-integer outer approximation of
//! [`RotationRelaxation`], making the program solvable to global optimality by branch and bound.
//! The optimum of the relaxation is a lower bound for the true problem; the generalized positions are
//! recovered afterwards by [`GlobalInverseKinematics::reconstruct_generalized_position_solution`].

use std::fmt;
use std::sync::Arc;

use nalgebra::{DVector, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{check_angle, check_dimension, IkError, IkResult};
use crate::kinematic_traits::Pose;
use crate::mathematical_program::{LinearExpression, MathematicalProgram, Variable};
use crate::plant::{BodyIndex, JointType, MultibodyPlant, WORLD_BODY};
use crate::reconstruction::{reconstruct, BodyTarget, Reconstruction, ReconstructionSettings};
use crate::rotation_relaxation::{add_norm_bound, RotationRelaxation};
use crate::solvers::{solve, MathematicalProgramResult, SolverOptions};
use crate::utils::is_valid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelaxationApproach {
    /// Norm bounds as polyhedral outer approximations, giving a mixed-integer linear program.
    Linear,
    /// Norm bounds as Lorentz cones.
    SecondOrderCone,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalBinning {
    /// One binary per interval.
    Linear,
    /// Gray-coded intervals, logarithmically many binaries.
    Logarithmic,
}

/// Relaxation settings of [`GlobalInverseKinematics`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Intervals on each of `[-1, 0]` and `[0, 1]`. More intervals, tighter relaxation, more binaries.
    pub num_intervals_per_half_axis: usize,
    pub approach: RelaxationApproach,
    pub interval_binning: IntervalBinning,
    /// Replace every conic term with linear constraints, whatever the approach.
    pub linear_constraint_only: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            num_intervals_per_half_axis: 2,
            approach: RelaxationApproach::SecondOrderCone,
            interval_binning: IntervalBinning::Logarithmic,
            linear_constraint_only: false,
        }
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_intervals_per_half_axis: {}, approach: {:?}, interval_binning: {:?}, linear_constraint_only: {}",
            self.num_intervals_per_half_axis, self.approach, self.interval_binning, self.linear_constraint_only
        )
    }
}

impl Options {
    /// True if norm bounds must be written as linear constraints.
    pub fn is_polyhedral(&self) -> bool {
        self.linear_constraint_only || self.approach == RelaxationApproach::Linear
    }

    fn validate(&self) -> IkResult<()> {
        if self.num_intervals_per_half_axis < 1 {
            return Err(IkError::InvalidArgument("num_intervals_per_half_axis must be at least 1".to_string()));
        }
        Ok(())
    }

    #[cfg(feature = "allow_filesystem")]
    pub fn from_yaml_str(yaml: &str) -> IkResult<Self> {
        let options: Options = serde_saphyr::from_str(yaml).map_err(|e| IkError::ParseError(format!("{}", e)))?;
        options.validate()?;
        Ok(options)
    }

    #[cfg(feature = "allow_filesystem")]
    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> IkResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}

pub struct GlobalInverseKinematics {
    plant: Arc<MultibodyPlant>,
    options: Options,
    prog: MathematicalProgram,
    R_WB: Vec<Matrix3<Variable>>,
    p_WB: Vec<Vector3<Variable>>,
    relaxations: Vec<Option<RotationRelaxation>>,
}

/// `R v` for a matrix of variables and a constant vector.
fn rotate(R: &Matrix3<Variable>, v: &Vector3<f64>) -> [LinearExpression; 3] {
    std::array::from_fn(|i| LinearExpression::sum((0..3).map(|k| (R[(i, k)], v[k]))))
}

/// Entry `(i, j)` of `R M` for a matrix of variables and a constant matrix.
fn rotation_product(R: &Matrix3<Variable>, M: &Matrix3<f64>, i: usize, j: usize) -> LinearExpression {
    LinearExpression::sum((0..3).map(|k| (R[(i, k)], M[(k, j)])))
}

/// Two unit vectors spanning the plane orthogonal to `axis`.
fn orthogonal_pair(axis: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let helper = if axis.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    let u = axis.cross(&helper).normalize();
    (u, axis.cross(&u))
}

impl GlobalInverseKinematics {
    /// Builds the relaxed program for every body of `plant`. The world body is fixed at the identity.
    /// Plants with prismatic joints are rejected.
    pub fn new(plant: Arc<MultibodyPlant>, options: Options) -> IkResult<Self> {
        options.validate()?;
        let mut prog = MathematicalProgram::new();
        let num_bodies = plant.num_bodies();
        let mut R_WB = Vec::with_capacity(num_bodies);
        let mut p_WB = Vec::with_capacity(num_bodies);
        for (index, body) in plant.bodies().iter().enumerate() {
            let R = prog.new_continuous_variables(9, &format!("R_W{}", body.name));
            let p = prog.new_continuous_variables(3, &format!("p_W{}", body.name));
            if index == WORLD_BODY.0 {
                let identity = DVector::from_row_slice(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
                prog.add_bounding_box_constraint(&identity, &identity, &R)?;
                prog.add_bounding_box_constraint(&DVector::zeros(3), &DVector::zeros(3), &p)?;
            } else {
                prog.add_bounding_box_constraint(&DVector::from_element(9, -1.0), &DVector::from_element(9, 1.0), &R)?;
            }
            R_WB.push(Matrix3::from_row_slice(&R));
            p_WB.push(Vector3::from_column_slice(&p));
        }

        let mut global_ik = GlobalInverseKinematics {
            plant: plant.clone(),
            options,
            prog,
            R_WB,
            p_WB,
            relaxations: vec![None; num_bodies],
        };
        for joint in plant.joints_in_tree_order() {
            let parent = joint.parent.0;
            let child = joint.child.0;
            let R_PJ = joint.X_PJ.rotation.to_rotation_matrix().into_inner();
            match &joint.joint_type {
                JointType::Prismatic { .. } => {
                    return Err(IkError::UnsupportedJoint { joint: joint.name.clone(), kind: joint.joint_type.name().to_string() });
                }
                JointType::Fixed => {
                    for i in 0..3 {
                        for j in 0..3 {
                            let expression = LinearExpression::from(global_ik.R_WB[child][(i, j)])
                                - rotation_product(&global_ik.R_WB[parent], &R_PJ, i, j);
                            global_ik.prog.add_linear_equality_constraint(expression, 0.0)?;
                        }
                    }
                    global_ik.add_joint_position(parent, child, &joint.X_PJ.translation.vector)?;
                }
                JointType::Revolute { axis } => {
                    global_ik.relax(child)?;
                    let a = axis.into_inner();
                    let child_axis = rotate(&global_ik.R_WB[child], &a);
                    let parent_axis = rotate(&global_ik.R_WB[parent], &(R_PJ * a));
                    for (c, p) in child_axis.into_iter().zip(parent_axis) {
                        global_ik.prog.add_linear_equality_constraint(c - p, 0.0)?;
                    }
                    global_ik.add_joint_position(parent, child, &joint.X_PJ.translation.vector)?;
                    global_ik.add_revolute_limits(parent, child, &R_PJ, &a, joint.lower_limits[0], joint.upper_limits[0])?;
                }
                JointType::QuaternionFloating => global_ik.relax(child)?,
            }
        }
        debug!(
            "Global IK over {} bodies ({}): {} variables, {} binaries",
            num_bodies,
            global_ik.options,
            global_ik.prog.num_vars(),
            global_ik.relaxations.iter().flatten().map(|r| r.num_binaries()).sum::<usize>()
        );
        Ok(global_ik)
    }

    fn relax(&mut self, body: usize) -> IkResult<()> {
        let name = format!("R_W{}", self.plant.bodies()[body].name);
        let relaxation = RotationRelaxation::add(&mut self.prog, &self.R_WB[body], &self.options, &name)?;
        self.relaxations[body] = Some(relaxation);
        Ok(())
    }

    /// `p_WC = p_WP + R_WP p_PJ`.
    fn add_joint_position(&mut self, parent: usize, child: usize, p_PJ: &Vector3<f64>) -> IkResult<()> {
        let offset = rotate(&self.R_WB[parent], p_PJ);
        for (i, o) in offset.into_iter().enumerate() {
            let expression = LinearExpression::from(self.p_WB[child][i]) - LinearExpression::from(self.p_WB[parent][i]) - o;
            self.prog.add_linear_equality_constraint(expression, 0.0)?;
        }
        Ok(())
    }

    /// Vectors orthogonal to the axis may turn at most half the joint range away from where they
    /// point at mid range: `|R_WC v - R_WP R_PJ Rot(a, θ_mid) v| <= 2 sin(δ/2)`.
    fn add_revolute_limits(
        &mut self,
        parent: usize,
        child: usize,
        R_PJ: &Matrix3<f64>,
        axis: &Vector3<f64>,
        lower: f64,
        upper: f64,
    ) -> IkResult<()> {
        let range = upper - lower;
        if !range.is_finite() || range >= 2.0 * std::f64::consts::PI {
            return Ok(());
        }
        let middle = 0.5 * (lower + upper);
        let half_range = 0.5 * range;
        let R_mid = R_PJ * Rotation3::new(axis * middle).into_inner();
        let (u, v) = orthogonal_pair(axis);
        for direction in [u, v] {
            let actual = rotate(&self.R_WB[child], &direction);
            let limit_center = rotate(&self.R_WB[parent], &(R_mid * direction));
            let difference = actual.into_iter().zip(limit_center).map(|(a, c)| a - c).collect();
            add_norm_bound(&mut self.prog, difference, 2.0 * (0.5 * half_range).sin(), self.options.is_polyhedral())?;
        }
        Ok(())
    }

    fn check_body(&self, body: BodyIndex) -> IkResult<usize> {
        self.plant.body(body)?;
        Ok(body.0)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn plant(&self) -> &Arc<MultibodyPlant> {
        &self.plant
    }

    /// Rotation matrix variables of `body`, relaxed for bodies on revolute or floating joints.
    pub fn body_rotation_matrix(&self, body: BodyIndex) -> IkResult<&Matrix3<Variable>> {
        Ok(&self.R_WB[self.check_body(body)?])
    }

    pub fn body_position(&self, body: BodyIndex) -> IkResult<&Vector3<Variable>> {
        Ok(&self.p_WB[self.check_body(body)?])
    }

    /// Point `Q` of `body` expressed in world.
    fn world_point(&self, body: usize, p_BQ: &Vector3<f64>) -> [LinearExpression; 3] {
        let mut point = rotate(&self.R_WB[body], p_BQ);
        for (i, e) in point.iter_mut().enumerate() {
            e.add_term(self.p_WB[body][i], 1.0);
        }
        point
    }

    /// `lower <= p_FQ <= upper` with `p_FQ = X_WF⁻¹ p_WQ`, for the point `Q` fixed on `body`.
    /// `X_WF` defaults to identity.
    pub fn add_world_position_constraint(
        &mut self,
        body: BodyIndex,
        p_BQ: &Vector3<f64>,
        lower: &Vector3<f64>,
        upper: &Vector3<f64>,
        X_WF: Option<&Pose>,
    ) -> IkResult<()> {
        let b = self.check_body(body)?;
        let p_WQ = self.world_point(b, p_BQ);
        self.add_position_window(p_WQ, lower, upper, X_WF)
    }

    /// `lower <= R_FW (p_WQ - p_WP) <= upper` for the point `Q` on `body_b` and `P` on `body_a`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_world_relative_position_constraint(
        &mut self,
        body_b: BodyIndex,
        p_BQ: &Vector3<f64>,
        body_a: BodyIndex,
        p_AP: &Vector3<f64>,
        lower: &Vector3<f64>,
        upper: &Vector3<f64>,
        X_WF: Option<&Pose>,
    ) -> IkResult<()> {
        let b = self.check_body(body_b)?;
        let a = self.check_body(body_a)?;
        let p_WQ = self.world_point(b, p_BQ);
        let p_WP = self.world_point(a, p_AP);
        let relative: [LinearExpression; 3] = std::array::from_fn(|i| p_WQ[i].clone() - p_WP[i].clone());
        // Only the rotation of F applies to a difference of points.
        let R_WF = X_WF.map(|X| Pose::from_parts(Translation3::identity(), X.rotation));
        self.add_position_window(relative, lower, upper, R_WF.as_ref())
    }

    fn add_position_window(
        &mut self,
        p_W: [LinearExpression; 3],
        lower: &Vector3<f64>,
        upper: &Vector3<f64>,
        X_WF: Option<&Pose>,
    ) -> IkResult<()> {
        for i in 0..3 {
            if lower[i].is_nan() || upper[i].is_nan() || lower[i] > upper[i] {
                return Err(IkError::InvalidBounds { what: "position window".to_string(), index: i, lower: lower[i], upper: upper[i] });
            }
        }
        let X_WF = X_WF.copied().unwrap_or_else(Pose::identity);
        let R_WF = X_WF.rotation.to_rotation_matrix().into_inner();
        let p_WF = X_WF.translation.vector;
        for i in 0..3 {
            // (R_WFᵀ (p_W - p_WF))_i
            let mut expression = LinearExpression::new();
            for (j, e) in p_W.iter().enumerate() {
                expression = expression + e.clone() * R_WF[(j, i)];
            }
            expression.add_constant(-R_WF.column(i).dot(&p_WF));
            self.prog.add_linear_constraint(expression, lower[i], upper[i])?;
        }
        Ok(())
    }

    /// Bounds the angle between the orientation of `body` and `desired` by `angle_tol` through the
    /// trace: `tr(R_desᵀ R_WB) >= 1 + 2 cos(angle_tol)`.
    pub fn add_world_orientation_constraint(
        &mut self,
        body: BodyIndex,
        desired: &UnitQuaternion<f64>,
        angle_tol: f64,
    ) -> IkResult<()> {
        let b = self.check_body(body)?;
        check_angle("angle_tol", angle_tol, 0.0, std::f64::consts::PI)?;
        let R_desired = desired.to_rotation_matrix().into_inner();
        let trace = LinearExpression::sum(
            (0..3).flat_map(|i| (0..3).map(move |j| (i, j))).map(|(i, j)| (self.R_WB[b][(i, j)], R_desired[(i, j)])),
        );
        self.prog.add_linear_constraint(trace, 1.0 + 2.0 * angle_tol.cos(), f64::INFINITY)?;
        Ok(())
    }

    /// Weighted distance of every body pose from the posture `q_desired`:
    /// `Σ w_p |p_WB - p_des| + w_R |R_WB - R_des|_F`. Weights are per body, world included (ignored).
    /// In polyhedral mode the norms are replaced with L1 norms.
    pub fn add_posture_cost(
        &mut self,
        q_desired: &DVector<f64>,
        body_position_cost: &DVector<f64>,
        body_orientation_cost: &DVector<f64>,
    ) -> IkResult<()> {
        let num_bodies = self.plant.num_bodies();
        check_dimension("desired posture", self.plant.num_positions(), q_desired.len())?;
        check_dimension("body position cost", num_bodies, body_position_cost.len())?;
        check_dimension("body orientation cost", num_bodies, body_orientation_cost.len())?;
        for (i, w) in body_position_cost.iter().chain(body_orientation_cost.iter()).enumerate() {
            if !(*w >= 0.0) || !w.is_finite() {
                return Err(IkError::InvalidArgument(format!("Posture cost weight {} must be non-negative, got {}", i, w)));
            }
        }
        let desired = self.plant.calc_body_poses(q_desired.as_slice())?;
        for b in 1..num_bodies {
            if body_position_cost[b] > 0.0 {
                let errors: Vec<LinearExpression> = (0..3)
                    .map(|i| LinearExpression::from(self.p_WB[b][i]) - LinearExpression::constant(desired[b].translation[i]))
                    .collect();
                self.add_norm_cost(errors, body_position_cost[b], &format!("position_error_{}", b))?;
            }
            if body_orientation_cost[b] > 0.0 {
                let errors: Vec<LinearExpression> = (0..3)
                    .flat_map(|i| (0..3).map(move |j| (i, j)))
                    .map(|(i, j)| {
                        LinearExpression::from(self.R_WB[b][(i, j)]) - LinearExpression::constant(desired[b].rotation[(i, j)])
                    })
                    .collect();
                self.add_norm_cost(errors, body_orientation_cost[b], &format!("orientation_error_{}", b))?;
            }
        }
        Ok(())
    }

    /// Adds `weight * |errors|` through slack variables.
    fn add_norm_cost(&mut self, errors: Vec<LinearExpression>, weight: f64, name: &str) -> IkResult<()> {
        if self.options.is_polyhedral() {
            let slacks = self.prog.new_continuous_variables(errors.len(), name);
            for (s, e) in slacks.iter().zip(errors) {
                self.prog.add_linear_constraint(LinearExpression::from(*s) - e.clone(), 0.0, f64::INFINITY)?;
                self.prog.add_linear_constraint(LinearExpression::from(*s) + e, 0.0, f64::INFINITY)?;
            }
            self.prog.add_linear_cost(LinearExpression::sum(slacks.iter().map(|s| (*s, weight))))
        } else {
            let slack = self.prog.new_continuous_variable(name);
            let mut rows = Vec::with_capacity(errors.len() + 1);
            rows.push(LinearExpression::from(slack));
            rows.extend(errors);
            self.prog.add_lorentz_cone_constraint(rows)?;
            self.prog.add_linear_cost(LinearExpression::from(slack) * weight)
        }
    }

    /// Sets the pose variables, and the relaxation weights and binaries, to the values at `q`.
    pub fn set_initial_guess(&mut self, q: &DVector<f64>) -> IkResult<()> {
        if !is_valid(q) {
            return Err(IkError::InvalidArgument(format!("Initial guess must be finite, got {:?}", q.as_slice())));
        }
        let poses = self.plant.calc_body_poses(q.as_slice())?;
        for (b, pose) in poses.iter().enumerate() {
            for i in 0..3 {
                for j in 0..3 {
                    self.prog.set_initial_guess_for(self.R_WB[b][(i, j)], pose.rotation[(i, j)])?;
                }
                self.prog.set_initial_guess_for(self.p_WB[b][i], pose.translation[i])?;
            }
            if let Some(relaxation) = &self.relaxations[b] {
                for (variable, value) in relaxation.initial_guess(&pose.rotation) {
                    self.prog.set_initial_guess_for(variable, value)?;
                }
            }
        }
        Ok(())
    }

    pub fn prog(&self) -> &MathematicalProgram {
        &self.prog
    }

    pub fn get_mutable_prog(&mut self) -> &mut MathematicalProgram {
        &mut self.prog
    }

    pub fn solve(&self, options: &SolverOptions) -> IkResult<MathematicalProgramResult> {
        solve(&self.prog, options)
    }

    pub fn reconstruct_generalized_position_solution(&self, result: &MathematicalProgramResult) -> IkResult<Reconstruction> {
        self.reconstruct_generalized_position_solution_with(result, &ReconstructionSettings::default())
    }

    /// Generalized positions that best fit the relaxed body poses of `result`. The quality of the fit
    /// is reported in the returned value.
    pub fn reconstruct_generalized_position_solution_with(
        &self,
        result: &MathematicalProgramResult,
        settings: &ReconstructionSettings,
    ) -> IkResult<Reconstruction> {
        check_dimension("solution", self.prog.num_vars(), result.x.len())?;
        let targets: Vec<BodyTarget> = self
            .R_WB
            .iter()
            .zip(&self.p_WB)
            .map(|(R, p)| (R.map(|v| result.get_solution(v)), p.map(|v| result.get_solution(v))))
            .collect();
        if targets.iter().any(|(R, p)| R.iter().chain(p.iter()).any(|x| !x.is_finite())) {
            return Err(IkError::InvalidArgument(format!("The result ({}) holds no body poses", result.status)));
        }
        reconstruct(&self.plant, &targets, settings)
    }
}
