//! Cartesian pose of the tool centre point

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A position in millimetres and an orientation as roll, pitch and yaw
/// angles in radians, all expressed in the robot base frame.
///
/// The orientation is `R = Rz(rz) * Ry(ry) * Rx(rx)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose6D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Pose6D {
    pub fn new(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self {
            x,
            y,
            z,
            rx,
            ry,
            rz,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_euler_angles(self.rx, self.ry, self.rz)
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(self.x, self.y, self.z),
            UnitQuaternion::from_euler_angles(self.rx, self.ry, self.rz),
        )
    }

    /// Homogeneous transform of this pose.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.to_isometry().to_homogeneous()
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        let (rx, ry, rz) = iso.rotation.euler_angles();
        let t = iso.translation.vector;

        Self::new(t.x, t.y, t.z, rx, ry, rz)
    }

    /// Build a pose from a homogeneous transform. The rotation block is
    /// assumed to be orthonormal.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let rot: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let (rx, ry, rz) = Rotation3::from_matrix_unchecked(rot).euler_angles();

        Self::new(m[(0, 3)], m[(1, 3)], m[(2, 3)], rx, ry, rz)
    }

    /// Euclidean distance between the positions of two poses.
    pub fn distance_mm(&self, other: &Pose6D) -> f64 {
        (self.position() - other.position()).norm()
    }

    /// Angle of the rotation taking this pose's orientation to the other's.
    pub fn angle_to_rad(&self, other: &Pose6D) -> f64 {
        self.rotation().angle_to(&other.rotation())
    }

    /// Copy of this pose at a different height.
    pub fn with_z(&self, z: f64) -> Self {
        Self { z, ..*self }
    }

    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.z, self.rx, self.ry, self.rz]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Pose as `[x, y, z, rx, ry, rz]`.
    pub fn to_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.rx, self.ry, self.rz]
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_matrix_round_trip() {
        let poses = [
            Pose6D::new(10.0, -20.0, 30.0, 0.1, -0.2, 0.3),
            Pose6D::new(-87.5, 100.0, 5.0, PI - 1e-3, 0.0, 0.0),
            Pose6D::new(0.0, 0.0, 0.0, -1.0, 1.2, -2.5),
        ];

        for pose in poses.iter() {
            let back = Pose6D::from_matrix(&pose.to_matrix());

            assert_abs_diff_eq!(back.distance_mm(pose), 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(back.angle_to_rad(pose), 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(back.rx, pose.rx, epsilon = 1e-9);
            assert_abs_diff_eq!(back.ry, pose.ry, epsilon = 1e-9);
            assert_abs_diff_eq!(back.rz, pose.rz, epsilon = 1e-9);

            let iso_back = Pose6D::from_isometry(&pose.to_isometry());
            assert_abs_diff_eq!(iso_back.distance_mm(pose), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_gripper_down_orientation() {
        // Roll of pi points the tool z axis down the base z axis
        let pose = Pose6D::new(0.0, 0.0, 50.0, PI, 0.0, 0.0);
        let approach = pose.rotation() * Vector3::z();

        assert_abs_diff_eq!(approach, -Vector3::z(), epsilon = 1e-12);
    }
}
