//! # Arm firmware interface
//!
//! The arm's servo controller is driven over a line-oriented serial protocol.
//! Every line sent by the host is terminated with CRLF and answered by a
//! single line, which is the token `OK` when the command was accepted.
//!
//! Two kinds of line are sent:
//!
//! - control tokens (`INIT`, `STOP`, `GRIP_CLOSE`, ...), see [`ControlCmd`],
//! - joint frames, one `#{id:03}P{pulse_width_us:04}T{duration_ms:04}` group
//!   per joint followed by a single `!`.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Number of joints on the arm.
pub const NUM_JOINTS: usize = 6;

/// Terminator appended to every line written to the firmware.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Acknowledgement token.
pub const ACK: &str = "OK";

/// Terminator of a joint frame.
pub const FRAME_TERMINATOR: char = '!';

/// Pulse width commanding the servo centre position.
pub const PULSE_WIDTH_CENTRE_US: f64 = 1500.0;

/// Pulse width span covering 180 degrees of servo travel.
pub const PULSE_WIDTH_PER_180_DEG_US: f64 = 1000.0;

pub const PULSE_WIDTH_MIN_US: u16 = 500;
pub const PULSE_WIDTH_MAX_US: u16 = 2500;

/// Largest duration representable in the four digit frame field.
pub const FRAME_DURATION_MAX_MS: u16 = 9999;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// One joint's entry in a joint frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointFrameEntry {
    pub id: u8,
    pub pulse_width_us: u16,
    pub duration_ms: u16,
}

/// Status of the arm as published to other services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStatus {
    /// Name of the controller mode (`Idle`, `Moving`, ...)
    pub mode: String,
    pub connected: bool,
    pub moving: bool,

    /// TCP pose as `[x_mm, y_mm, z_mm, rx_rad, ry_rad, rz_rad]`
    pub current_position: [f64; 6],

    pub current_joints_rad: [f64; NUM_JOINTS],
    pub gripper_closed: bool,
    pub last_error: Option<String>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Control commands understood by the firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCmd {
    /// Handshake sent once the port is open.
    Init,

    /// Halt all servos immediately.
    Stop,

    GripClose,
    GripOpen,

    /// Request the current joint positions, answered by a comma separated
    /// list of angles in degrees.
    GetJointPos,

    /// Latch the current joint positions as the zero position.
    SetHome,

    /// Move all joints directly to the given angles at the given speed.
    MoveJoint {
        joints_deg: [f64; NUM_JOINTS],
        speed_pct: u8,
    },
}

/// Errors raised when parsing lines of the protocol.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed joint frame: {0:?}")]
    MalformedFrame(String),

    #[error("Expected {} joint values but found {0}", NUM_JOINTS)]
    WrongJointCount(usize),

    #[error("Invalid number in reply: {0:?}")]
    InvalidNumber(String),
}

// ------------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// ------------------------------------------------------------------------------------------------

impl ControlCmd {
    /// The line sent to the firmware for this command, without terminator.
    pub fn to_line(&self) -> String {
        match self {
            ControlCmd::Init => "INIT".into(),
            ControlCmd::Stop => "STOP".into(),
            ControlCmd::GripClose => "GRIP_CLOSE".into(),
            ControlCmd::GripOpen => "GRIP_OPEN".into(),
            ControlCmd::GetJointPos => "GET_JOINT_POS".into(),
            ControlCmd::SetHome => "SET_HOME".into(),
            ControlCmd::MoveJoint {
                joints_deg,
                speed_pct,
            } => format!(
                "MOVE_JOINT {},{}",
                format_joint_positions(joints_deg),
                speed_pct
            ),
        }
    }
}

impl fmt::Display for ControlCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

impl JointFrameEntry {
    fn to_wire(&self) -> String {
        format!(
            "#{:03}P{:04}T{:04}",
            self.id, self.pulse_width_us, self.duration_ms
        )
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Servo pulse width for a joint angle in degrees.
///
/// The width is truncated to whole microseconds, as the firmware expects, and
/// clamped to [`PULSE_WIDTH_MIN_US`, `PULSE_WIDTH_MAX_US`]. A NaN angle maps
/// to the centre position.
pub fn pulse_width_us(angle_deg: f64) -> u16 {
    if angle_deg.is_nan() {
        return PULSE_WIDTH_CENTRE_US as u16;
    }

    let pw = PULSE_WIDTH_CENTRE_US + angle_deg / 180.0 * PULSE_WIDTH_PER_180_DEG_US;

    pw.trunc()
        .max(PULSE_WIDTH_MIN_US as f64)
        .min(PULSE_WIDTH_MAX_US as f64) as u16
}

/// Joint angle in degrees commanded by a pulse width.
pub fn angle_from_pulse_width(pulse_width_us: u16) -> f64 {
    (pulse_width_us as f64 - PULSE_WIDTH_CENTRE_US) / PULSE_WIDTH_PER_180_DEG_US * 180.0
}

/// Encode a joint frame for the given joint angles in degrees.
pub fn encode_joint_frame(joints_deg: &[f64; NUM_JOINTS], duration_ms: u16) -> String {
    let duration_ms = duration_ms.min(FRAME_DURATION_MAX_MS);

    let mut frame: String = joints_deg
        .iter()
        .enumerate()
        .map(|(id, angle)| {
            JointFrameEntry {
                id: id as u8,
                pulse_width_us: pulse_width_us(*angle),
                duration_ms,
            }
            .to_wire()
        })
        .collect();
    frame.push(FRAME_TERMINATOR);

    frame
}

/// Decode a joint frame into its per-joint entries.
pub fn decode_joint_frame(frame: &str) -> Result<Vec<JointFrameEntry>, ProtocolError> {
    let malformed = || ProtocolError::MalformedFrame(frame.to_string());

    let body = frame.trim().strip_suffix(FRAME_TERMINATOR).ok_or_else(malformed)?;

    let mut entries = Vec::with_capacity(NUM_JOINTS);

    for group in body.split('#').skip(1) {
        // Each group is `iiiPppppTtttt`
        let p_idx = group.find('P').ok_or_else(malformed)?;
        let t_idx = group.find('T').ok_or_else(malformed)?;
        if t_idx < p_idx {
            return Err(malformed());
        }

        let parse = |s: &str| s.parse::<u16>().map_err(|_| malformed());

        entries.push(JointFrameEntry {
            id: parse(&group[..p_idx])? as u8,
            pulse_width_us: parse(&group[p_idx + 1..t_idx])?,
            duration_ms: parse(&group[t_idx + 1..])?,
        });
    }

    if entries.is_empty() || !body.starts_with('#') {
        return Err(malformed());
    }

    Ok(entries)
}

/// Whether a reply line is the acknowledgement token.
pub fn is_ack(line: &str) -> bool {
    line.trim() == ACK
}

/// Whether a line sent to the firmware is a joint frame.
pub fn is_joint_frame(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('#') && line.ends_with(FRAME_TERMINATOR)
}

/// Format joint angles in degrees as a comma separated list.
pub fn format_joint_positions(joints_deg: &[f64; NUM_JOINTS]) -> String {
    joints_deg
        .iter()
        .map(|j| format!("{:.2}", j))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse the reply to `GET_JOINT_POS` into joint angles in degrees.
pub fn parse_joint_positions(line: &str) -> Result<[f64; NUM_JOINTS], ProtocolError> {
    let values: Vec<&str> = line.trim().split(',').map(str::trim).collect();

    if values.len() != NUM_JOINTS {
        return Err(ProtocolError::WrongJointCount(values.len()));
    }

    let mut joints = [0.0; NUM_JOINTS];
    for (joint, value) in joints.iter_mut().zip(values) {
        *joint = match value.parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => return Err(ProtocolError::InvalidNumber(value.to_string())),
        };
    }

    Ok(joints)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pulse_width() {
        assert_eq!(pulse_width_us(0.0), 1500);
        assert_eq!(pulse_width_us(90.0), 2000);
        assert_eq!(pulse_width_us(-90.0), 1000);
        assert_eq!(pulse_width_us(180.0), 2500);

        // Fractions of a microsecond are dropped
        assert_eq!(pulse_width_us(45.1), 1750);
        assert_eq!(pulse_width_us(0.17), 1500);
        assert_eq!(pulse_width_us(-0.17), 1499);
        assert_eq!(pulse_width_us(5.0), 1527);

        // Out of range angles saturate
        assert_eq!(pulse_width_us(200.0), 2500);
        assert_eq!(pulse_width_us(-720.0), 500);
        assert_eq!(pulse_width_us(f64::INFINITY), 2500);
        assert_eq!(pulse_width_us(f64::NAN), 1500);
    }

    #[test]
    fn test_encode_joint_frame() {
        let frame = encode_joint_frame(&[0.0, 90.0, -90.0, 180.0, -180.0, 45.0], 1000);

        assert_eq!(
            frame,
            "#000P1500T1000#001P2000T1000#002P1000T1000\
             #003P2500T1000#004P0500T1000#005P1750T1000!"
        );
        assert!(is_joint_frame(&frame));
        assert!(!is_joint_frame("GRIP_OPEN"));

        // Durations longer than the field saturate
        assert!(encode_joint_frame(&[0.0; NUM_JOINTS], 20000).contains("T9999"));
    }

    #[test]
    fn test_decode_joint_frame() {
        let entries = decode_joint_frame(&encode_joint_frame(
            &[0.0, 90.0, -90.0, 0.0, 0.0, 0.0],
            250,
        ))
        .unwrap();

        assert_eq!(entries.len(), NUM_JOINTS);
        assert_eq!(
            entries[1],
            JointFrameEntry {
                id: 1,
                pulse_width_us: 2000,
                duration_ms: 250
            }
        );
        assert_eq!(angle_from_pulse_width(entries[2].pulse_width_us), -90.0);

        assert!(decode_joint_frame("#000P1500T1000").is_err());
        assert!(decode_joint_frame("#000PabcdT1000!").is_err());
        assert!(decode_joint_frame("!").is_err());
    }

    #[test]
    fn test_control_tokens() {
        assert_eq!(ControlCmd::Init.to_line(), "INIT");
        assert_eq!(ControlCmd::Stop.to_line(), "STOP");
        assert_eq!(ControlCmd::GripClose.to_line(), "GRIP_CLOSE");
        assert_eq!(ControlCmd::GripOpen.to_line(), "GRIP_OPEN");
        assert_eq!(ControlCmd::GetJointPos.to_line(), "GET_JOINT_POS");
        assert_eq!(ControlCmd::SetHome.to_line(), "SET_HOME");
        assert_eq!(
            ControlCmd::MoveJoint {
                joints_deg: [0.0, 10.0, -20.5, 0.0, 45.0, 0.0],
                speed_pct: 50
            }
            .to_line(),
            "MOVE_JOINT 0.00,10.00,-20.50,0.00,45.00,0.00,50"
        );
    }

    #[test]
    fn test_ack() {
        assert!(is_ack("OK"));
        assert!(is_ack("OK\r\n"));
        assert!(!is_ack("ERR"));
        assert!(!is_ack("OK!"));
        assert!(!is_ack(""));
    }

    #[test]
    fn test_parse_joint_positions() {
        assert_eq!(
            parse_joint_positions("0.00, 10.5,-20,0,45,0\r\n").unwrap(),
            [0.0, 10.5, -20.0, 0.0, 45.0, 0.0]
        );
        assert_eq!(
            parse_joint_positions("1,2,3"),
            Err(ProtocolError::WrongJointCount(3))
        );
        assert_eq!(
            parse_joint_positions("1,2,3,4,5,x"),
            Err(ProtocolError::InvalidNumber("x".into()))
        );
    }
}
