//! Parameters structure for ArmCtrl

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::{ArmCtrlError, BoardParams};
use crate::dev_link::LinkParams;
use crate::kin::{KinParams, KinematicModel};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for Arm control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    // ---- MOTION ----
    /// Number of interpolation steps of a planned move.
    pub traj_steps: usize,

    /// Wait after each waypoint is acknowledged.
    ///
    /// Units: seconds
    pub waypoint_settle_s: f64,

    /// Duration the firmware takes to reach each waypoint.
    ///
    /// Units: milliseconds
    pub frame_duration_ms: u16,

    /// Wait after a gripper command is acknowledged.
    ///
    /// Units: seconds
    pub gripper_settle_s: f64,

    /// Wait after a direct joint move is acknowledged.
    ///
    /// Units: seconds
    pub jog_settle_s: f64,

    /// Speed of direct joint moves.
    ///
    /// Units: percent
    pub jog_speed_pct: u8,

    // ---- GRASPING ----
    /// Height above the board at which the arm travels between squares.
    ///
    /// Units: millimetres
    pub safe_height_mm: f64,

    /// Height above the board at which pieces are grasped and released.
    ///
    /// Units: millimetres
    pub grasp_height_mm: f64,

    /// Tool orientation over the board as roll, pitch and yaw.
    ///
    /// Units: radians
    pub grasp_orientation_rad: [f64; 3],

    // ---- SUBSYSTEMS ----
    pub link: LinkParams,

    pub kin: KinParams,

    pub board: BoardParams,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for Params {
    fn default() -> Self {
        Self {
            traj_steps: 20,
            waypoint_settle_s: 0.1,
            frame_duration_ms: 1000,
            gripper_settle_s: 0.5,
            jog_settle_s: 2.0,
            jog_speed_pct: 50,
            safe_height_mm: 50.0,
            grasp_height_mm: 5.0,
            grasp_orientation_rad: [PI, 0.0, 0.0],
            link: LinkParams::default(),
            kin: KinParams::default(),
            board: BoardParams::default(),
        }
    }
}

impl Params {
    /// Check the parameters are consistent before any hardware is touched.
    pub fn are_valid(&self) -> Result<(), ArmCtrlError> {
        let invalid = |msg: &str| Err(ArmCtrlError::InvalidParams(msg.into()));

        if self.traj_steps == 0 {
            return invalid("traj_steps must be at least 1");
        }

        let durations = [
            self.waypoint_settle_s,
            self.gripper_settle_s,
            self.jog_settle_s,
            self.link.ack_poll_s,
            self.link.open_settle_s,
        ];
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return invalid("settle and poll durations must be finite and non-negative");
        }

        if !(self.link.ack_timeout_s.is_finite() && self.link.ack_timeout_s > 0.0) {
            return invalid("ack_timeout_s must be positive");
        }

        if self.jog_speed_pct == 0 || self.jog_speed_pct > 100 {
            return invalid("jog_speed_pct must be in 1..=100");
        }

        if !(self.board.square_pitch_mm.is_finite() && self.board.square_pitch_mm > 0.0) {
            return invalid("square_pitch_mm must be positive");
        }

        if !(self.safe_height_mm > self.grasp_height_mm) {
            return invalid("safe_height_mm must be above grasp_height_mm");
        }

        KinematicModel::new(&self.kin)?;

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
    fn test_default_params_valid() {
        assert!(Params::default().are_valid().is_ok());
    }

    #[test]
    fn test_invalid_params() {
        let mut p = Params::default();
        p.traj_steps = 0;
        assert!(p.are_valid().is_err());

        let mut p = Params::default();
        p.grasp_height_mm = 60.0;
        assert!(p.are_valid().is_err());

        let mut p = Params::default();
        p.kin.max_pos_rad[1] = -2.0;
        assert!(matches!(p.are_valid(), Err(ArmCtrlError::Kinematics(_))));
    }

    #[test]
    fn test_load_from_toml() {
        let p: Params = util::params::parse(include_str!("../../../params/arm_exec.toml")).unwrap();

        assert!(p.are_valid().is_ok());
        assert_eq!(p, Params::default());
    }
}
