//! # Calibration module
//!
//! Estimators refining the kinematic model of the arm from measurements:
//!
//! - [`refine_dh`] fits the link geometry (DH `a`, `d` and `alpha` of every
//!   joint) to measured tool positions by nonlinear least squares.
//! - [`calibrate_hand_eye`] registers the camera mounted on the gripper by
//!   solving `AX = XB` over pairs of arm and target poses.
//!
//! Both are pure functions of their samples. Installing the results in the
//! model and saving them is left to the caller, see
//! [`crate::calib_session::CalibSession`].

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod artifact;
mod dh_refine;
mod hand_eye;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use crate::arm_ctrl::{ArmCtrlError, ErrorKind};

pub use artifact::*;
pub use dh_refine::*;
pub use hand_eye::*;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors raised by the calibration estimators and session.
#[derive(Debug, thiserror::Error)]
pub enum CalibError {
    #[error("Calibration needs at least {required} samples, {provided} were provided")]
    InsufficientData { required: usize, provided: usize },

    #[error("Calibration did not converge: {0}")]
    Divergence(String),

    #[error("Calibration samples do not constrain the solution: {0}")]
    Degenerate(String),

    #[error("Arm error during calibration: {0}")]
    Arm(#[from] ArmCtrlError),

    #[error("Could not access the calibration file: {0}")]
    ArtifactIo(#[from] std::io::Error),

    #[error("Invalid calibration file: {0}")]
    ArtifactFormat(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CalibError {
    /// The failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CalibError::InsufficientData { .. } => ErrorKind::CalibrationInsufficientData,
            CalibError::Divergence(_) | CalibError::Degenerate(_) => {
                ErrorKind::CalibrationDivergence
            }
            CalibError::Arm(e) => e.kind(),
            CalibError::ArtifactIo(_) | CalibError::ArtifactFormat(_) => ErrorKind::InvalidInput,
        }
    }
}
