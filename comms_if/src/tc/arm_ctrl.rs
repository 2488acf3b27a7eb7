//! # Arm control telecommands

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use structopt::clap::AppSettings;
use structopt::StructOpt;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A command that can be completed by arm control.
///
/// Commands arrive either as JSON on the event bus (tagged by `type`) or as
/// console lines parsed with structopt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, StructOpt)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArmCmd {
    /// Move the arm to its zero joint position via a safe height.
    #[structopt(name = "home")]
    Home,

    /// Move a piece from one square to another.
    #[structopt(name = "move")]
    ExecuteMove {
        /// Source square, for example `e2`
        from: String,

        /// Destination square, for example `e4`
        to: String,
    },

    /// Pick up the piece on a square.
    #[structopt(name = "pick")]
    Pick { square: String },

    /// Place the held piece on a square.
    #[structopt(name = "place")]
    Place { square: String },

    /// Move the gripper over a square at the given height.
    #[structopt(name = "goto")]
    MoveToSquare {
        square: String,

        /// Height above the board in millimetres
        #[structopt(default_value = "50")]
        height_mm: f64,
    },

    /// Move the TCP to a cartesian pose.
    #[structopt(name = "pose", setting = AppSettings::AllowNegativeNumbers)]
    MoveToPose {
        x_mm: f64,
        y_mm: f64,
        z_mm: f64,

        /// Roll about the base x axis
        rx_rad: f64,

        /// Pitch about the base y axis
        ry_rad: f64,

        /// Yaw about the base z axis
        rz_rad: f64,
    },

    /// Open or close the gripper.
    #[structopt(name = "grip")]
    Gripper {
        /// Close the gripper, otherwise it is opened
        #[structopt(long)]
        close: bool,
    },

    /// Read back the joint positions reported by the firmware.
    #[structopt(name = "joints")]
    ReadJoints,

    /// Stop the arm immediately and flush all pending commands.
    #[structopt(name = "stop")]
    Stop,
}

impl ArmCmd {
    /// Short name of the command for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ArmCmd::Home => "home",
            ArmCmd::ExecuteMove { .. } => "execute_move",
            ArmCmd::Pick { .. } => "pick",
            ArmCmd::Place { .. } => "place",
            ArmCmd::MoveToSquare { .. } => "move_to_square",
            ArmCmd::MoveToPose { .. } => "move_to_pose",
            ArmCmd::Gripper { .. } => "gripper",
            ArmCmd::ReadJoints => "read_joints",
            ArmCmd::Stop => "stop",
        }
    }
}
