//! Denavit-Hartenberg link geometry

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use super::{JointVector, NUM_JOINTS};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Standard DH parameters of one link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DhParam {
    /// Link length along the common normal.
    ///
    /// Units: millimetres
    pub a: f64,

    /// Link offset along the previous z axis.
    ///
    /// Units: millimetres
    pub d: f64,

    /// Link twist about the common normal.
    ///
    /// Units: radians
    pub alpha: f64,

    /// Joint angle offset added to the commanded joint position.
    ///
    /// Units: radians
    pub theta: f64,
}

/// A complete set of DH parameters, one per joint.
pub type DhSet = [DhParam; NUM_JOINTS];

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl DhParam {
    pub const fn new(a: f64, d: f64, alpha: f64, theta: f64) -> Self {
        Self { a, d, alpha, theta }
    }

    /// Homogeneous transform from this link's frame to the previous one for
    /// the given joint position.
    #[rustfmt::skip]
    pub fn transform(&self, joint_rad: f64) -> Matrix4<f64> {
        let (st, ct) = (self.theta + joint_rad).sin_cos();
        let (sa, ca) = self.alpha.sin_cos();

        Matrix4::new(
            ct, -st * ca, st * sa, self.a * ct,
            st, ct * ca, -ct * sa, self.a * st,
            0.0, sa, ca, self.d,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.a.is_finite() && self.d.is_finite() && self.alpha.is_finite() && self.theta.is_finite()
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Transform from the tool centre point frame to the base frame.
pub fn forward_chain(dh: &DhSet, tool_offset: &Vector3<f64>, joints: &JointVector) -> Matrix4<f64> {
    let flange = partial_chain(dh, joints, NUM_JOINTS);

    flange * Matrix4::new_translation(tool_offset)
}

/// Transform of the frame of link `num_links` relative to the base.
pub fn partial_chain(dh: &DhSet, joints: &JointVector, num_links: usize) -> Matrix4<f64> {
    dh.iter()
        .zip(joints.iter())
        .take(num_links)
        .fold(Matrix4::identity(), |t, (link, q)| t * link.transform(*q))
}

/// TCP position only, used by calibration where orientation is not observed.
pub fn tcp_position(dh: &DhSet, tool_offset: &Vector3<f64>, joints: &JointVector) -> Vector3<f64> {
    let t = forward_chain(dh, tool_offset, joints);

    Vector3::new(t[(0, 3)], t[(1, 3)], t[(2, 3)])
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
