//! Inverse kinematics for multibody plants, formulated as mathematical programs.
//!
//! Geometric requirements on a kinematic tree (keep a point in a box, bound the angle between two
//! body-fixed vectors, keep a gaze cone on a target, keep clearance between collision geometries,
//! stay close to an orientation, keep the center of mass over a support polygon) are expressed as
//! differentiable constraints and costs over the generalized positions `q`, and added to a
//! [`MathematicalProgram`](mathematical_program::MathematicalProgram) that is then solved by a
//! nonlinear or a mixed-integer conic backend.
//!
//! # Features
//!
//! - Constraints and costs evaluate with plain `f64` or with forward mode [`AutoDiff`](autodiff::AutoDiff),
//!   so Jacobians are exact and come from the same code as the values.
//! - [`InverseKinematics`](inverse_kinematics::InverseKinematics) owns a program over `q` and offers
//!   one method per constraint or cost kind. Joint limits and unit quaternions of floating bodies are
//!   added on construction.
//! - Parallel multistart over random seeds with `rayon`.
//! - [`GlobalInverseKinematics`](global_inverse_kinematics::GlobalInverseKinematics) formulates whole-body
//!   IK over per-body rotation matrices and positions with a mixed-integer convex relaxation of SO(3),
//!   solved by branch and bound, and reconstructs `q` from the relaxed body poses.
//! - Plants can be built in code or loaded from URDF, solver settings from YAML.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use nalgebra::{Isometry3, Vector3};
//! use rs_multibody_ik::inverse_kinematics::InverseKinematics;
//! use rs_multibody_ik::plant::{JointType, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
//! use rs_multibody_ik::solvers::SolverOptions;
//!
//! let mut builder = MultibodyPlantBuilder::new();
//! let link = builder.add_rigid_body("link", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::zeros());
//! builder.add_joint("hinge", JointType::Revolute { axis: Vector3::z_axis() }, WORLD_BODY,
//!                   Isometry3::identity(), link, Some((-3.0, 3.0)));
//! let tip = builder.add_frame("tip", link, Isometry3::translation(1.0, 0.0, 0.0));
//! let plant = Arc::new(builder.build().unwrap());
//!
//! let mut ik = InverseKinematics::new(plant.clone(), true).unwrap();
//! let target = Vector3::new(0.0, 1.0, 0.0);
//! ik.add_position_constraint(tip, &Vector3::zeros(), plant.world_frame(), &target, &target).unwrap();
//! let result = ik.solve(None, &SolverOptions::default()).unwrap();
//! assert!(result.is_success());
//! assert!((ik.positions(&result)[0] - std::f64::consts::FRAC_PI_2).abs() < 1e-3);
//! ```
#![allow(non_snake_case)]

pub mod error;
pub mod autodiff;
pub mod kinematic_traits;

#[path = "utils/utils.rs"]
pub mod utils;

pub mod plant;
pub mod context;
pub mod kinematic_evaluator;
pub mod jacobian;

#[cfg(feature = "collisions")]
pub mod geometry;

pub mod constraints;
pub mod costs;

#[path = "ik_constraints/position_constraint.rs"]
pub mod position_constraint;

#[path = "ik_constraints/orientation_constraint.rs"]
pub mod orientation_constraint;

#[path = "ik_constraints/angle_between_vectors_constraint.rs"]
pub mod angle_between_vectors_constraint;

#[path = "ik_constraints/gaze_target_constraint.rs"]
pub mod gaze_target_constraint;

#[path = "ik_constraints/point_to_point_distance_constraint.rs"]
pub mod point_to_point_distance_constraint;

#[path = "ik_constraints/polyhedron_constraint.rs"]
pub mod polyhedron_constraint;

#[path = "ik_constraints/com_constraints.rs"]
pub mod com_constraints;

#[path = "ik_constraints/unit_quaternion_constraint.rs"]
pub mod unit_quaternion_constraint;

#[cfg(feature = "collisions")]
#[path = "ik_constraints/distance_constraints.rs"]
pub mod distance_constraints;

#[path = "ik_costs/position_cost.rs"]
pub mod position_cost;

#[path = "ik_costs/orientation_cost.rs"]
pub mod orientation_cost;

#[path = "solvers/mathematical_program.rs"]
pub mod mathematical_program;

#[path = "solvers/solution_result.rs"]
pub mod solution_result;

#[path = "solvers/solver_options.rs"]
pub mod solver_options;

#[path = "solvers/nonlinear_solver.rs"]
mod nonlinear_solver;

#[path = "solvers/branch_and_bound.rs"]
mod branch_and_bound;

#[path = "solvers/solve.rs"]
pub mod solvers;

pub mod inverse_kinematics;

#[path = "global_ik/rotation_relaxation.rs"]
pub mod rotation_relaxation;

#[path = "global_ik/reconstruction.rs"]
pub mod reconstruction;

#[path = "global_ik/global_inverse_kinematics.rs"]
pub mod global_inverse_kinematics;

#[cfg(feature = "allow_filesystem")]
pub mod urdf;

#[cfg(test)]
mod tests;
