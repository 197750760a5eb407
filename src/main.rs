use std::f64::consts::PI;
use std::sync::Arc;

use anyhow::{Context, Result};
use nalgebra::{DVector, Isometry3, Rotation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rs_multibody_ik::global_inverse_kinematics::{GlobalInverseKinematics, Options};
use rs_multibody_ik::inverse_kinematics::{solve_multistart, InverseKinematics};
use rs_multibody_ik::plant::{JointType, MultibodyPlant, MultibodyPlantBuilder, DEFAULT_MODEL_INSTANCE, WORLD_BODY};
use rs_multibody_ik::solvers::SolverOptions;
use rs_multibody_ik::utils::dump_positions;

/// Planar arm with two links of 0.5 m on vertical axes, and a tool frame at the tip.
fn two_link_arm() -> Result<Arc<MultibodyPlant>> {
    let mut builder = MultibodyPlantBuilder::new();
    let upper = builder.add_rigid_body("upper", DEFAULT_MODEL_INSTANCE, 2.0, Vector3::new(0.25, 0.0, 0.0));
    let lower = builder.add_rigid_body("lower", DEFAULT_MODEL_INSTANCE, 1.0, Vector3::new(0.25, 0.0, 0.0));
    builder.add_joint("shoulder", JointType::Revolute { axis: Vector3::z_axis() }, WORLD_BODY,
                      Isometry3::identity(), upper, Some((-PI, PI)));
    builder.add_joint("elbow", JointType::Revolute { axis: Vector3::z_axis() }, upper,
                      Isometry3::translation(0.5, 0.0, 0.0), lower, Some((-2.5, 2.5)));
    builder.add_frame("tool", lower, Isometry3::translation(0.5, 0.0, 0.0));
    Ok(Arc::new(builder.build()?))
}

/// Usage example.
fn main() -> Result<()> {
    let plant = two_link_arm()?;
    let tool = plant.get_frame_by_name("tool")?;
    let target = Vector3::new(0.4, 0.6, 0.0);
    let options = SolverOptions::default();

    println!("Local IK, tool at {:?}", target.as_slice());
    let mut ik = InverseKinematics::new(plant.clone(), true)?;
    ik.add_position_constraint(tool, &Vector3::zeros(), plant.world_frame(), &target, &target)?;
    let result = ik.solve(Some(&DVector::from_vec(vec![0.3, 0.3])), &options)?;
    println!("{}", result);
    dump_positions(&ik.positions(&result));

    println!("Multistart from random seeds, both elbow configurations should show up");
    let mut rng = StdRng::seed_from_u64(7);
    let seeds: Vec<DVector<f64>> = (0..6).map(|_| plant.random_positions(&mut rng)).collect();
    let solutions = solve_multistart(&plant, &seeds, |ik| {
        ik.add_position_constraint(tool, &Vector3::zeros(), plant.world_frame(), &target, &target)?;
        Ok(())
    }, &options);
    for solution in solutions {
        match solution {
            Ok((q, result)) if result.is_success() => dump_positions(&q),
            Ok((_, result)) => println!("No solution: {}", result.status),
            Err(e) => println!("Failed: {}", e),
        }
    }

    println!("Global IK, tool at {:?}, lower link pointing along Y", target.as_slice());
    let mut global_ik = GlobalInverseKinematics::new(plant.clone(), Options::default())?;
    let lower = plant.get_body_by_name("lower")?;
    global_ik.add_world_position_constraint(lower, &Vector3::new(0.5, 0.0, 0.0), &target, &target, None)?;
    let pointing = UnitQuaternion::from_rotation_matrix(&Rotation3::from_axis_angle(&Vector3::z_axis(), PI / 2.0));
    global_ik.add_world_orientation_constraint(lower, &pointing, 0.3)?;
    let result = global_ik.solve(&options).context("Global IK failed")?;
    println!("{}", result);
    if result.is_success() {
        let reconstruction = global_ik.reconstruct_generalized_position_solution(&result)?;
        println!("Reconstruction {:?}, rotation error {:.2e}, position error {:.2e}",
                 reconstruction.quality, reconstruction.max_rotation_error, reconstruction.max_position_error);
        dump_positions(&reconstruction.q);
    }
    Ok(())
}
