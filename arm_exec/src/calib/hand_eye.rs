//! Hand-eye calibration of the camera mounted on the gripper
//!
//! With the calibration target fixed in the workspace, every sample `i` gives
//! the same target pose in the base frame:
//!
//! ```text
//! base_T_target = G_i * X * C_i
//! ```
//!
//! where `G_i` is the gripper pose from forward kinematics, `C_i` the target
//! pose seen by the camera and `X` the unknown camera pose in the gripper
//! frame. For any two samples `A X = X B` with `A = G_i^-1 G_j` and
//! `B = C_i C_j^-1`. The rotation is solved first from the quaternion form of
//! the equation, then the translation by linear least squares.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::eqpt::vision::TargetPose;
use log::{debug, info, warn};
use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix3, Matrix4, Quaternion, Rotation3, Translation3,
    UnitQuaternion, Vector3,
};
use serde::{Deserialize, Serialize};

use super::CalibError;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Fewest paired poses a hand-eye calibration is attempted with.
pub const MIN_HAND_EYE_SAMPLES: usize = 3;

/// Below this ratio of smallest to largest singular value a linear system is
/// treated as rank deficient.
const DEGENERATE_SV_RATIO: f64 = 1e-6;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A pair of poses observed at one arm configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandEyeSample {
    /// Gripper pose in the base frame
    pub base_t_gripper: Matrix4<f64>,

    /// Target pose in the camera frame
    pub cam_t_target: Matrix4<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandEyeParams {
    /// Pairs of samples whose relative rotation is smaller than this carry
    /// little information and are skipped.
    ///
    /// Units: radians
    pub min_pair_rotation_rad: f64,
}

/// Result of a hand-eye calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct HandEyeCalibration {
    /// Camera pose in the gripper frame
    pub gripper_t_camera: Matrix4<f64>,

    /// Number of sample pairs used
    pub num_pairs: usize,

    /// Mean rotation error of `A X = X B` over the pairs
    ///
    /// Units: radians
    pub mean_rotation_error_rad: f64,

    /// Mean translation error of `A X = X B` over the pairs
    ///
    /// Units: millimetres
    pub mean_translation_error_mm: f64,
}

struct MotionPair {
    a: Isometry3<f64>,
    b: Isometry3<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl HandEyeSample {
    pub fn new(base_t_gripper: Matrix4<f64>, target: &TargetPose) -> Self {
        Self {
            base_t_gripper,
            cam_t_target: Matrix4::from_fn(|r, c| target.cam_t_target[r][c]),
        }
    }
}

impl Default for HandEyeParams {
    fn default() -> Self {
        Self {
            min_pair_rotation_rad: 5f64.to_radians(),
        }
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Compute the camera pose in the gripper frame from paired observations.
///
/// At least [`MIN_HAND_EYE_SAMPLES`] samples are required, taken at arm
/// poses rotating about at least two different axes.
pub fn calibrate_hand_eye(
    samples: &[HandEyeSample],
    params: &HandEyeParams,
) -> Result<HandEyeCalibration, CalibError> {
    if samples.len() < MIN_HAND_EYE_SAMPLES {
        return Err(CalibError::InsufficientData {
            required: MIN_HAND_EYE_SAMPLES,
            provided: samples.len(),
        });
    }

    let poses: Vec<(Isometry3<f64>, Isometry3<f64>)> = samples
        .iter()
        .map(|s| (to_isometry(&s.base_t_gripper), to_isometry(&s.cam_t_target)))
        .collect();

    let mut pairs = Vec::new();
    for i in 0..poses.len() {
        for j in (i + 1)..poses.len() {
            let a = poses[i].0.inverse() * poses[j].0;
            let b = poses[i].1 * poses[j].1.inverse();

            let angle = a.rotation.angle().min(b.rotation.angle());
            if angle < params.min_pair_rotation_rad {
                debug!("Skipping pair ({}, {}), rotation {:.4} rad", i, j, angle);
                continue;
            }

            pairs.push(MotionPair { a, b });
        }
    }

    if pairs.len() < 2 {
        return Err(CalibError::Degenerate(format!(
            "only {} sample pairs rotate by more than {:.4} rad",
            pairs.len(),
            params.min_pair_rotation_rad
        )));
    }

    let rotation = solve_rotation(&pairs)?;
    let translation = solve_translation(&pairs, &rotation)?;
    let x = Isometry3::from_parts(Translation3::from(translation), rotation);

    let (rot_err, trans_err) = pairs.iter().fold((0.0, 0.0), |(r, t), p| {
        let lhs = p.a * x;
        let rhs = x * p.b;
        (
            r + lhs.rotation.angle_to(&rhs.rotation),
            t + (lhs.translation.vector - rhs.translation.vector).norm(),
        )
    });
    let n = pairs.len() as f64;

    let calib = HandEyeCalibration {
        gripper_t_camera: x.to_homogeneous(),
        num_pairs: pairs.len(),
        mean_rotation_error_rad: rot_err / n,
        mean_translation_error_mm: trans_err / n,
    };

    info!(
        "Hand-eye calibration over {} pairs, mean errors {:.5} rad and {:.3} mm",
        calib.num_pairs, calib.mean_rotation_error_rad, calib.mean_translation_error_mm
    );

    Ok(calib)
}

/// Rotation of `X` from `q_A * q_X = q_X * q_B` stacked over all pairs.
fn solve_rotation(pairs: &[MotionPair]) -> Result<UnitQuaternion<f64>, CalibError> {
    let mut m = DMatrix::<f64>::zeros(4 * pairs.len(), 4);

    for (idx, p) in pairs.iter().enumerate() {
        let block = quat_left(&positive(&p.a.rotation)) - quat_right(&positive(&p.b.rotation));
        m.view_mut((4 * idx, 0), (4, 4)).copy_from(&block);
    }

    let svd = m.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| CalibError::Degenerate("SVD of the rotation system failed".into()))?;

    // The null space must be one dimensional
    let mut sv: Vec<f64> = svd.singular_values.iter().copied().collect();
    sv.sort_by(|a, b| a.total_cmp(b));
    if sv[1] < DEGENERATE_SV_RATIO * sv[3] {
        warn!("Hand-eye rotation is not constrained, singular values {:?}", sv);
        return Err(CalibError::Degenerate(
            "all motions rotate about the same axis".into(),
        ));
    }

    let q = v_t.row(svd.singular_values.imin());
    Ok(UnitQuaternion::from_quaternion(Quaternion::new(
        q[0], q[1], q[2], q[3],
    )))
}

/// Translation of `X` from `(R_A - I) t_X = R_X t_B - t_A` stacked over all
/// pairs.
fn solve_translation(
    pairs: &[MotionPair],
    rotation: &UnitQuaternion<f64>,
) -> Result<Vector3<f64>, CalibError> {
    let rot_x = rotation.to_rotation_matrix().into_inner();

    let mut c = DMatrix::<f64>::zeros(3 * pairs.len(), 3);
    let mut w = DVector::<f64>::zeros(3 * pairs.len());

    for (idx, p) in pairs.iter().enumerate() {
        let rot_a = p.a.rotation.to_rotation_matrix().into_inner();

        c.view_mut((3 * idx, 0), (3, 3))
            .copy_from(&(rot_a - Matrix3::identity()));
        w.rows_mut(3 * idx, 3)
            .copy_from(&(rot_x * p.b.translation.vector - p.a.translation.vector));
    }

    let svd = c.svd(true, true);
    let (min, max) = (svd.singular_values.min(), svd.singular_values.max());
    if min < DEGENERATE_SV_RATIO * max {
        return Err(CalibError::Degenerate(
            "translation is not constrained by the motions".into(),
        ));
    }

    let t = svd
        .solve(&w, 1e-12)
        .map_err(|e| CalibError::Degenerate(e.to_string()))?;

    Ok(Vector3::new(t[0], t[1], t[2]))
}

/// Rigid transform closest to a homogeneous matrix.
fn to_isometry(m: &Matrix4<f64>) -> Isometry3<f64> {
    let rot: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&rot));

    Isometry3::from_parts(Translation3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]), rotation)
}

/// The quaternion of a rotation with a non-negative scalar part, so that the
/// quaternions of `A` and `B`, which rotate by the same angle, agree in sign.
fn positive(q: &UnitQuaternion<f64>) -> Quaternion<f64> {
    if q.w < 0.0 {
        -q.into_inner()
    } else {
        q.into_inner()
    }
}

/// Matrix of `p * q` as a linear map of `q`, in `(w, x, y, z)` order.
#[rustfmt::skip]
fn quat_left(p: &Quaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (p.w, p.i, p.j, p.k);
    Matrix4::new(
        w, -x, -y, -z,
        x,  w, -z,  y,
        y,  z,  w, -x,
        z, -y,  x,  w,
    )
}

/// Matrix of `p * q` as a linear map of `p`, in `(w, x, y, z)` order.
#[rustfmt::skip]
fn quat_right(q: &Quaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(
        w, -x, -y, -z,
        x,  w,  z, -y,
        y, -z,  w,  x,
        z,  y, -x,  w,
    )
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
