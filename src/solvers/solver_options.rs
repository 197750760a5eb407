//! Tuning of the solver backends, optionally read from YAML.

use serde::{Deserialize, Serialize};

#[cfg(feature = "allow_filesystem")]
use std::path::Path;

#[cfg(feature = "allow_filesystem")]
use crate::error::{IkError, IkResult};

/// Settings shared by both backends. Every field has a default, so a YAML file needs to list only
/// what it changes:
///
/// ```yaml
/// max_outer_iterations: 100
/// feasibility_tolerance: 1.0e-5
/// max_duration_ms: 2000
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverOptions {
    /// Inner (PANOC) tolerance on the fixed point residual.
    pub tolerance: f64,
    /// Initial inner tolerance, relaxed down to `tolerance` over outer iterations.
    pub initial_tolerance: f64,
    /// Required constraint satisfaction (ALM delta tolerance and final feasibility check).
    pub feasibility_tolerance: f64,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub lbfgs_memory: usize,
    pub initial_penalty: f64,
    /// Growth of the ALM penalty between outer iterations, must exceed 1.
    pub penalty_update_factor: f64,
    /// Damped Gauss-Newton steps on the constraint residual when ALM stops short of
    /// `feasibility_tolerance`. Zero disables the restoration.
    pub max_restoration_iterations: usize,
    pub max_duration_ms: u64,

    /// Branch and bound node limit.
    pub max_nodes: usize,
    pub absolute_gap: f64,
    pub relative_gap: f64,
    pub integrality_tolerance: f64,
    /// Interior point iterations per node relaxation.
    pub conic_max_iterations: u32,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            tolerance: 1e-6,
            initial_tolerance: 1e-4,
            feasibility_tolerance: 1e-6,
            max_outer_iterations: 50,
            max_inner_iterations: 500,
            lbfgs_memory: 10,
            initial_penalty: 10.0,
            penalty_update_factor: 2.0,
            max_restoration_iterations: 100,
            max_duration_ms: 10_000,
            max_nodes: 5_000,
            absolute_gap: 1e-6,
            relative_gap: 1e-4,
            integrality_tolerance: 1e-6,
            conic_max_iterations: 200,
        }
    }
}

#[cfg(feature = "allow_filesystem")]
impl SolverOptions {
    pub fn from_yaml_str(yaml: &str) -> IkResult<Self> {
        serde_saphyr::from_str_with_options(
            yaml,
            serde_saphyr::Options { angle_conversions: true, ..Default::default() },
        ).map_err(|e| IkError::ParseError(format!("{}", e)))
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> IkResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}
