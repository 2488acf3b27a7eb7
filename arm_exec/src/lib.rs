//! # Arm library.
//!
//! This library allows other crates in the workspace, and the integration
//! tests, to access the items defined inside the arm crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Arm control module - chess board motions, gripper and emergency stop
pub mod arm_ctrl;

/// Calibration estimators - DH refinement and hand-eye registration
pub mod calib;

/// Calibration session - drives the arm and the metrology through a calibration
pub mod calib_session;

/// Device link - acknowledged serial link to the arm firmware
pub mod dev_link;

/// Kinematics - DH model, forward and inverse kinematics
pub mod kin;

/// Trajectory planner - joint space interpolation within the joint limits
pub mod traj_plan;
