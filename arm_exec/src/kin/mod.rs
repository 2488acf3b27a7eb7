//! # Kinematics module
//!
//! Forward and inverse kinematics of the six axis arm. The arm is an
//! anthropomorphic arm with a spherical wrist: joints 1 to 3 position the
//! wrist centre and joints 4 to 6 orient the tool about it.
//!
//! Joint positions are radians, lengths are millimetres.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod dh;
mod model;
mod pose;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

pub use dh::*;
pub use model::*;
pub use pose::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// The number of joints on the arm.
pub const NUM_JOINTS: usize = comms_if::eqpt::arm::NUM_JOINTS;

/// Factory DH parameters.
pub const DEFAULT_DH: DhSet = [
    DhParam::new(0.0, 105.0, FRAC_PI_2, 0.0),
    DhParam::new(160.0, 0.0, 0.0, FRAC_PI_2),
    DhParam::new(0.0, 0.0, FRAC_PI_2, 0.0),
    DhParam::new(0.0, 160.0, -FRAC_PI_2, 0.0),
    DhParam::new(0.0, 0.0, FRAC_PI_2, 0.0),
    DhParam::new(0.0, 40.0, 0.0, 0.0),
];

/// Factory tool centre point offset from the flange, in the flange frame.
pub const DEFAULT_TOOL_OFFSET_MM: [f64; 3] = [0.0, 0.0, 45.0];

pub const DEFAULT_MIN_POS_RAD: JointVector = [-PI, -FRAC_PI_2, -FRAC_PI_2, -PI, -2.0, -PI];
pub const DEFAULT_MAX_POS_RAD: JointVector = [PI, FRAC_PI_2, FRAC_PI_2, PI, 2.0, PI];

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Joint positions of the arm.
///
/// Units: radians
pub type JointVector = [f64; NUM_JOINTS];

/// Static joint limit table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub min_rad: JointVector,
    pub max_rad: JointVector,
}

/// Geometry parameters of the arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinParams {
    /// DH parameters of each link
    pub dh: DhSet,

    /// Translation from the flange to the tool centre point, in the flange
    /// frame.
    ///
    /// Units: millimetres
    pub tool_offset_mm: [f64; 3],

    /// Minimum joint positions
    ///
    /// Units: radians
    pub min_pos_rad: JointVector,

    /// Maximum joint positions
    ///
    /// Units: radians
    pub max_pos_rad: JointVector,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors raised by the kinematic model.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum KinError {
    #[error("Pose is outside the arm's workspace (elbow sine argument {0:.4})")]
    Unreachable(f64),

    #[error(
        "Joint {joint} position {angle_rad:.4} rad is outside its limits \
        [{min_rad:.4}, {max_rad:.4}]"
    )]
    JointLimitExceeded {
        joint: usize,
        angle_rad: f64,
        min_rad: f64,
        max_rad: f64,
    },

    #[error(
        "Inverse kinematics did not converge (residual {position_mm:.2e} mm, \
        {angle_rad:.2e} rad)"
    )]
    NotConverged { position_mm: f64, angle_rad: f64 },

    #[error("Invalid kinematic parameters: {0}")]
    InvalidParams(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for KinParams {
    fn default() -> Self {
        Self {
            dh: DEFAULT_DH,
            tool_offset_mm: DEFAULT_TOOL_OFFSET_MM,
            min_pos_rad: DEFAULT_MIN_POS_RAD,
            max_pos_rad: DEFAULT_MAX_POS_RAD,
        }
    }
}

impl KinParams {
    pub fn limits(&self) -> JointLimits {
        JointLimits {
            min_rad: self.min_pos_rad,
            max_rad: self.max_pos_rad,
        }
    }
}

impl JointLimits {
    /// Check every joint lies within its limits, limits inclusive. Non finite
    /// positions always fail.
    pub fn check(&self, joints: &JointVector) -> Result<(), KinError> {
        for (i, q) in joints.iter().enumerate() {
            if !(*q >= self.min_rad[i] && *q <= self.max_rad[i]) {
                return Err(KinError::JointLimitExceeded {
                    joint: i,
                    angle_rad: *q,
                    min_rad: self.min_rad[i],
                    max_rad: self.max_rad[i],
                });
            }
        }

        Ok(())
    }

    /// Check the table itself is consistent.
    pub fn validate(&self) -> Result<(), KinError> {
        for i in 0..NUM_JOINTS {
            if !(self.min_rad[i].is_finite()
                && self.max_rad[i].is_finite()
                && self.min_rad[i] < self.max_rad[i])
            {
                return Err(KinError::InvalidParams(format!(
                    "joint {} limits [{}, {}] are not an increasing range",
                    i, self.min_rad[i], self.max_rad[i]
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_limits_check() {
        let limits = KinParams::default().limits();

        assert!(limits.check(&[0.0; NUM_JOINTS]).is_ok());
        assert!(limits.check(&DEFAULT_MAX_POS_RAD).is_ok());
        assert!(limits.check(&DEFAULT_MIN_POS_RAD).is_ok());

        assert_eq!(
            limits.check(&[0.0, 0.0, 0.0, 0.0, 2.1, 0.0]),
            Err(KinError::JointLimitExceeded {
                joint: 4,
                angle_rad: 2.1,
                min_rad: -2.0,
                max_rad: 2.0
            })
        );
        assert!(limits.check(&[f64::NAN, 0.0, 0.0, 0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_limits_validate() {
        let mut limits = KinParams::default().limits();
        assert!(limits.validate().is_ok());

        limits.min_rad[2] = limits.max_rad[2];
        assert!(matches!(limits.validate(), Err(KinError::InvalidParams(_))));
    }
}
