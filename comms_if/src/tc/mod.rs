//! # Telecommand module
//!
//! Parsing of commands addressed to the arm, either JSON documents received
//! from other services or lines typed at the console.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod arm_ctrl;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use arm_ctrl::ArmCmd;
use structopt::StructOpt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Possible parsing errors.
#[derive(Debug, Error)]
pub enum TcParseError {
    #[error("TC contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Empty command")]
    Empty,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Parse an arm command from a JSON document such as
/// `{"type": "execute_move", "from": "e2", "to": "e4"}`.
pub fn from_json(json_str: &str) -> Result<ArmCmd, TcParseError> {
    serde_json::from_str(json_str).map_err(TcParseError::InvalidJson)
}

/// Parse an arm command from a console line such as `move e2 e4`.
pub fn from_line(line: &str) -> Result<ArmCmd, TcParseError> {
    if line.trim().is_empty() {
        return Err(TcParseError::Empty);
    }

    ArmCmd::from_iter_safe(std::iter::once("arm").chain(line.split_whitespace()))
        .map_err(|e| TcParseError::InvalidCommand(e.message))
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_json() {
        assert_eq!(
            from_json(r#"{"type": "execute_move", "from": "e2", "to": "e4"}"#).unwrap(),
            ArmCmd::ExecuteMove {
                from: "e2".into(),
                to: "e4".into()
            }
        );
        assert_eq!(from_json(r#"{"type": "home"}"#).unwrap(), ArmCmd::Home);
        assert!(matches!(
            from_json(r#"{"type": "dance"}"#),
            Err(TcParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_from_line() {
        assert_eq!(
            from_line("move e2 e4").unwrap(),
            ArmCmd::ExecuteMove {
                from: "e2".into(),
                to: "e4".into()
            }
        );
        assert_eq!(
            from_line("goto h8").unwrap(),
            ArmCmd::MoveToSquare {
                square: "h8".into(),
                height_mm: 50.0
            }
        );
        assert_eq!(
            from_line("pose -87.5 100 50 3.14 0 -0.5").unwrap(),
            ArmCmd::MoveToPose {
                x_mm: -87.5,
                y_mm: 100.0,
                z_mm: 50.0,
                rx_rad: 3.14,
                ry_rad: 0.0,
                rz_rad: -0.5
            }
        );
        assert_eq!(
            from_line("grip --close").unwrap(),
            ArmCmd::Gripper { close: true }
        );
        assert_eq!(from_line("grip").unwrap(), ArmCmd::Gripper { close: false });
        assert!(matches!(from_line("   "), Err(TcParseError::Empty)));
        assert!(matches!(
            from_line("move e2"),
            Err(TcParseError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_round_trip_json() {
        let cmd = ArmCmd::Pick {
            square: "g1".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"type":"pick","square":"g1"}"#);
        assert_eq!(from_json(&json).unwrap(), cmd);
    }
}
