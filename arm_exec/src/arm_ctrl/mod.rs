//! # Arm control module
//!
//! High level control of the arm: chess board motions (pick, place, execute
//! move), cartesian and joint moves, gripper control and the emergency stop.
//!
//! [`ArmCtrl`] performs the operations synchronously and owns the robot
//! state. [`ArmService`] runs it on a worker thread so that at most one
//! command is in flight and an emergency stop can be issued at any time.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod board;
mod params;
mod service;
mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::eqpt::arm::ProtocolError;
use serde::{Deserialize, Serialize};

use crate::dev_link::LinkError;
use crate::kin::KinError;
use crate::traj_plan::PlanError;

pub use board::*;
pub use params::*;
pub use service::*;
pub use state::*;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible errors that can occur during ArmCtrl operation.
#[derive(Debug, thiserror::Error)]
pub enum ArmCtrlError {
    #[error("The arm is not connected (mode {0:?})")]
    NotConnected(ArmMode),

    #[error("Invalid square {0:?}, expected a file a-h followed by a rank 1-8")]
    InvalidSquare(String),

    #[error("Kinematics error: {0}")]
    Kinematics(#[from] KinError),

    #[error("Trajectory error: {0}")]
    Plan(#[from] PlanError),

    #[error("Device link error: {0}")]
    Link(#[from] LinkError),

    #[error("Invalid reply from the firmware: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Emergency stop was not acknowledged by the firmware: {0}")]
    StopNotAcknowledged(LinkError),

    #[error("Invalid arm control parameters: {0}")]
    InvalidParams(String),

    #[error("Could not start the arm worker thread: {0}")]
    WorkerSpawnFailed(std::io::Error),

    #[error("The arm service has stopped")]
    ServiceStopped,
}

/// Failure categories reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Serial link could not be opened, the handshake failed or the arm is
    /// not connected.
    Connection,

    /// A command was not acknowledged in time or received an unexpected
    /// reply.
    ProtocolTimeout,

    /// The inverse kinematics has no solution for the requested pose.
    UnreachablePose,

    /// A solution or waypoint is outside the joint limits.
    JointLimitExceeded,

    /// Too few samples were provided to a calibration.
    CalibrationInsufficientData,

    /// A calibration optimisation failed to converge.
    CalibrationDivergence,

    /// Emergency stop triggered or not acknowledged.
    HardwareFault,

    /// Malformed square, command or parameter.
    InvalidInput,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ArmCtrlError {
    /// The failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArmCtrlError::NotConnected(_) => ErrorKind::Connection,
            ArmCtrlError::InvalidSquare(_) => ErrorKind::InvalidInput,
            ArmCtrlError::Kinematics(e) => match e {
                KinError::Unreachable(_) | KinError::NotConverged { .. } => {
                    ErrorKind::UnreachablePose
                }
                KinError::JointLimitExceeded { .. } => ErrorKind::JointLimitExceeded,
                KinError::InvalidParams(_) => ErrorKind::InvalidInput,
            },
            ArmCtrlError::Plan(e) => match e {
                PlanError::NoSteps => ErrorKind::InvalidInput,
                PlanError::InvalidWaypoint { .. } => ErrorKind::JointLimitExceeded,
            },
            ArmCtrlError::Link(e) => match e {
                LinkError::AckTimeout { .. } | LinkError::Rejected { .. } => {
                    ErrorKind::ProtocolTimeout
                }
                LinkError::Aborted => ErrorKind::HardwareFault,
                _ => ErrorKind::Connection,
            },
            ArmCtrlError::Protocol(_) => ErrorKind::ProtocolTimeout,
            ArmCtrlError::StopNotAcknowledged(_) => ErrorKind::HardwareFault,
            ArmCtrlError::InvalidParams(_) => ErrorKind::InvalidInput,
            ArmCtrlError::WorkerSpawnFailed(_) | ArmCtrlError::ServiceStopped => {
                ErrorKind::Connection
            }
        }
    }

    /// Whether the error is the result of an emergency stop.
    pub fn is_abort(&self) -> bool {
        matches!(self, ArmCtrlError::Link(LinkError::Aborted))
    }
}

impl ErrorKind {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connection | ErrorKind::ProtocolTimeout)
    }

    /// Whether the request was rejected before the arm moved.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidInput | ErrorKind::UnreachablePose | ErrorKind::JointLimitExceeded
        )
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
