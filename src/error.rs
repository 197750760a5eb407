//! Error handling for constraint construction, plant building and file loaders

use std::io;
use thiserror::Error;

/// Unified error for everything that can fail before a solver runs. Solver outcomes
/// (infeasible, iteration limit) are not errors, see [`crate::solvers::SolutionResult`].
#[derive(Debug, Error)]
pub enum IkError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("{name} = {value} is outside [{min}, {max}]")]
    AngleOutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid bounds for {what} at {index}: lower {lower} > upper {upper}")]
    InvalidBounds {
        what: String,
        index: usize,
        lower: f64,
        upper: f64,
    },

    #[error("Context was created for a different plant")]
    ContextMismatch,

    #[error("Context lock is poisoned")]
    ContextPoisoned,

    #[error("Unknown frame: {0}")]
    UnknownFrame(String),

    #[error("Unknown body: {0}")]
    UnknownBody(String),

    #[error("Unknown joint: {0}")]
    UnknownJoint(String),

    #[error("Unknown model instance: {0}")]
    UnknownModelInstance(String),

    #[error("Unknown geometry: {0}")]
    UnknownGeometry(String),

    #[error("Malformed model instance list: {0}")]
    MalformedModelInstances(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid kinematic tree: {0}")]
    InvalidTree(String),

    #[error("Joint {joint} of type {kind} is not supported here")]
    UnsupportedJoint { joint: String, kind: String },

    #[error("Unsupported program: {0}")]
    UnsupportedProgram(String),

    #[error("Solver error: {0}")]
    Solver(String),

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse Error: {0}")]
    ParseError(String),

    #[error("XML Processing Error: {0}")]
    XmlProcessingError(String),

    #[error("Missing Field: {0}")]
    MissingField(String),

    #[error("Wrong angle representation: {0}")]
    WrongAngle(String),
}

pub type IkResult<T> = Result<T, IkError>;

/// Checks that the given length matches the expected one.
pub(crate) fn check_dimension(what: &str, expected: usize, found: usize) -> IkResult<()> {
    if expected != found {
        return Err(IkError::DimensionMismatch {
            what: what.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Checks that the angle is within `[min, max]` (and is not NaN).
pub(crate) fn check_angle(name: &str, value: f64, min: f64, max: f64) -> IkResult<()> {
    if !(value >= min && value <= max) {
        return Err(IkError::AngleOutOfRange {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Normalized copy of a direction vector. Zero and non-finite vectors are rejected.
pub(crate) fn check_direction(name: &str, v: &nalgebra::Vector3<f64>) -> IkResult<nalgebra::Vector3<f64>> {
    let norm = v.norm();
    if !norm.is_finite() || norm < f64::EPSILON {
        return Err(IkError::InvalidArgument(format!("{} must be a non-zero finite vector, got {:?}", name, v)));
    }
    Ok(v / norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IkError::DimensionMismatch { what: "lower bound".into(), expected: 3, found: 2 };
        assert_eq!(format!("{err}"), "Dimension mismatch for lower bound: expected 3, found 2");

        let err = check_angle("theta_bound", 4.0, 0.0, std::f64::consts::PI).unwrap_err();
        assert!(format!("{err}").contains("theta_bound"));
    }

    #[test]
    fn test_nan_angle_rejected() {
        assert!(check_angle("angle", f64::NAN, 0.0, 1.0).is_err());
        assert!(check_angle("angle", 0.5, 0.0, 1.0).is_ok());
    }
}
