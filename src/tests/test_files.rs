use nalgebra::{DVector, Vector3};

use crate::global_inverse_kinematics::{IntervalBinning, Options, RelaxationApproach};
use crate::inverse_kinematics::InverseKinematics;
use crate::solvers::SolverOptions;
use crate::tests::test_utils::{assert_vectors_close, two_link_arm};
use crate::urdf::{plant_from_urdf_file, FloatingBase};

const URDF: &str = "src/tests/data/two_link_arm.urdf";
const READ_ERROR: &str = "Failed to load test data";

#[test]
fn test_urdf_matches_plant_built_in_code() {
    let loaded = plant_from_urdf_file(URDF, FloatingBase::Welded).expect(READ_ERROR);
    let built = two_link_arm();
    assert_eq!(loaded.num_positions(), 2);

    let elbow = loaded.joint(loaded.get_joint_by_name("elbow").unwrap()).unwrap();
    assert!((elbow.upper_limits[0] - 143.24f64.to_radians()).abs() < 1e-12);

    let tool_loaded = loaded.get_frame_by_name("tool").unwrap();
    let tool_built = built.get_frame_by_name("tool").unwrap();
    for q in [[0.0, 0.0], [0.5, -1.0], [-2.0, 2.2]] {
        let a = loaded.calc_frame_pose_in_world(&q, tool_loaded).unwrap().translation_value();
        let b = built.calc_frame_pose_in_world(&q, tool_built).unwrap().translation_value();
        assert_vectors_close(&a, &b, 1e-12);
    }
    #[cfg(feature = "collisions")]
    assert_eq!(loaded.geometries().len(), 3);
}

#[test]
fn test_ik_on_loaded_plant() {
    let plant = std::sync::Arc::new(plant_from_urdf_file(URDF, FloatingBase::Welded).expect(READ_ERROR));
    let tool = plant.get_frame_by_name("tool").unwrap();
    let target = Vector3::new(-0.2, 0.6, 0.0);
    let mut ik = InverseKinematics::new(plant.clone(), true).unwrap();
    ik.add_position_constraint(tool, &Vector3::zeros(), plant.world_frame(), &target, &target).unwrap();
    let options = SolverOptions::from_yaml_file("src/tests/data/solver_options.yaml").expect(READ_ERROR);
    let result = ik.solve(Some(&DVector::from_vec(vec![1.0, 0.5])), &options).unwrap();
    assert!(result.is_success(), "{}", result);
    let q = ik.positions(&result);
    let p = plant.calc_frame_pose_in_world(q.as_slice(), tool).unwrap().translation_value();
    assert_vectors_close(&p, &target, 1e-5);
}

#[test]
fn test_solver_options_from_yaml() {
    let options = SolverOptions::from_yaml_file("src/tests/data/solver_options.yaml").expect(READ_ERROR);
    assert_eq!(options.feasibility_tolerance, 1e-7);
    assert_eq!(options.max_outer_iterations, 80);
    assert_eq!(options.max_duration_ms, 5000);
    assert_eq!(options.max_nodes, 2000);
    assert_eq!(options.lbfgs_memory, SolverOptions::default().lbfgs_memory);
    assert!(SolverOptions::from_yaml_file("src/tests/data/missing.yaml").is_err());
}

#[test]
fn test_global_options_from_yaml() {
    let options = Options::from_yaml_file("src/tests/data/global_options.yaml").expect(READ_ERROR);
    assert_eq!(options.num_intervals_per_half_axis, 3);
    assert_eq!(options.approach, RelaxationApproach::Linear);
    assert_eq!(options.interval_binning, IntervalBinning::Linear);
    assert!(options.linear_constraint_only);
    assert!(Options::from_yaml_str("num_intervals_per_half_axis: 0\n").is_err());
}
