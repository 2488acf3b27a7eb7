//! # Vision interface
//!
//! Payloads supplied by the vision system during calibration.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A 3D point measured by an external metrology source, in the robot base
/// frame, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasuredPoint {
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
}

/// Pose of the calibration target as seen by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetPose {
    /// Homogeneous transform from the target frame to the camera frame,
    /// row-major, translation in millimetres.
    pub cam_t_target: [[f64; 4]; 4],
}

impl MeasuredPoint {
    pub fn new(x_mm: f64, y_mm: f64, z_mm: f64) -> Self {
        Self { x_mm, y_mm, z_mm }
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.x_mm, self.y_mm, self.z_mm]
    }
}
