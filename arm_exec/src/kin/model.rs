//! The kinematic model of the arm

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::trace;
use nalgebra::{Matrix3, Matrix4, Matrix6, Vector3, Vector6};
use std::f64::consts::PI;
use util::maths::wrap_to_pi;

use super::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Below this sine of joint 5 the wrist is treated as singular, joints 4 and
/// 6 then share one rotation axis.
const WRIST_SINGULAR_SIN: f64 = 1e-9;

/// Iterations allowed to bring the closed-form solution onto the full chain.
const IK_MAX_ITERATIONS: usize = 20;

/// Residuals below which the refinement stops.
const IK_STOP_MM: f64 = 1e-9;
const IK_STOP_RAD: f64 = 1e-12;

/// Residuals below which a refined solution is accepted.
const IK_ACCEPT_MM: f64 = 1e-6;
const IK_ACCEPT_RAD: f64 = 1e-9;

/// Joint step of the central differences giving the Jacobian.
///
/// Units: radians
const IK_FD_STEP: f64 = 1e-7;

/// Damping added to the normal equations, bounds the steps near the wrist
/// singularity.
const IK_DAMPING: f64 = 1e-4;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Forward and inverse kinematics of the arm.
///
/// The DH set is only ever replaced as a whole, so readers always see a
/// consistent set of link parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct KinematicModel {
    dh: DhSet,
    tool_offset: Vector3<f64>,
    limits: JointLimits,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl KinematicModel {
    /// Build a model from the geometry parameters.
    pub fn new(params: &KinParams) -> Result<Self, KinError> {
        let limits = params.limits();
        limits.validate()?;
        validate_dh(&params.dh)?;

        if !params.tool_offset_mm.iter().all(|v| v.is_finite()) {
            return Err(KinError::InvalidParams("tool offset is not finite".into()));
        }

        Ok(Self {
            dh: params.dh,
            tool_offset: Vector3::from(params.tool_offset_mm),
            limits,
        })
    }

    pub fn dh_parameters(&self) -> &DhSet {
        &self.dh
    }

    /// Replace the whole DH set.
    pub fn set_dh_parameters(&mut self, dh: DhSet) -> Result<(), KinError> {
        validate_dh(&dh)?;
        self.dh = dh;

        Ok(())
    }

    pub fn tool_offset(&self) -> &Vector3<f64> {
        &self.tool_offset
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    /// Homogeneous transform of the tool centre point for the given joints.
    pub fn forward_matrix(&self, joints: &JointVector) -> Matrix4<f64> {
        forward_chain(&self.dh, &self.tool_offset, joints)
    }

    /// Pose of the tool centre point for the given joints.
    pub fn forward(&self, joints: &JointVector) -> Pose6D {
        Pose6D::from_matrix(&self.forward_matrix(joints))
    }

    /// Joint positions placing the tool centre point at the given pose.
    ///
    /// A single solution branch is returned: elbow with a non-negative
    /// cosine and wrist with a non-negative sine of joint 5. When the wrist
    /// is singular joint 4 is set to zero and joint 6 takes the whole
    /// rotation.
    ///
    /// The closed-form solution only knows the arm's nominal structure, so it
    /// is then refined against the full DH chain. This brings in every
    /// calibrated parameter while staying on the same branch. The refined
    /// solution is checked against the joint limits.
    pub fn inverse(&self, pose: &Pose6D) -> Result<JointVector, KinError> {
        if !pose.is_finite() {
            return Err(KinError::InvalidParams(format!(
                "pose {:?} is not finite",
                pose
            )));
        }

        let seed = self.closed_form(pose)?;
        let joints = self.refine(&pose.to_matrix(), seed)?;

        self.limits.check(&joints)?;

        Ok(joints)
    }

    /// Spherical-wrist solution using `d1`, `a2`, `d4`, `d6` and the theta
    /// offsets only.
    fn closed_form(&self, pose: &Pose6D) -> Result<JointVector, KinError> {
        let rot = pose.rotation().into_inner();
        let pos = pose.position();

        let d1 = self.dh[0].d;
        let a2 = self.dh[1].a;
        let d4 = self.dh[3].d;
        let d6 = self.dh[5].d;

        // Wrist centre, back along the approach axis from the TCP
        let approach: Vector3<f64> = rot.column(2).into_owned();
        let wrist = pos - rot * self.tool_offset - approach * d6;

        // Base yaw
        let th1 = wrist.y.atan2(wrist.x);

        // Elbow from the law of cosines in the arm plane
        let r = wrist.x.hypot(wrist.y);
        let s = wrist.z - d1;

        let s3 = (r * r + s * s - a2 * a2 - d4 * d4) / (2.0 * a2 * d4);
        if !s3.is_finite() || s3.abs() > 1.0 {
            return Err(KinError::Unreachable(s3));
        }
        let c3 = (1.0 - s3 * s3).sqrt();
        let th3 = s3.atan2(c3);

        // Shoulder
        let k1 = a2 + d4 * s3;
        let k2 = d4 * c3;
        let th2 = (k1 * s + k2 * r).atan2(k1 * r - k2 * s);

        let mut joints = [0.0; NUM_JOINTS];
        joints[0] = wrap_to_pi(th1 - self.dh[0].theta);
        joints[1] = wrap_to_pi(th2 - self.dh[1].theta);
        joints[2] = wrap_to_pi(th3 - self.dh[2].theta);

        // Wrist orientation relative to the forearm frame, which for a
        // spherical wrist is a ZYZ Euler rotation
        let t03 = partial_chain(&self.dh, &joints, 3);
        let r03: Matrix3<f64> = t03.fixed_view::<3, 3>(0, 0).into_owned();
        let r36 = r03.transpose() * rot;

        let sin5 = r36[(0, 2)].hypot(r36[(1, 2)]);
        let (th4, th5, th6) = if sin5 > WRIST_SINGULAR_SIN {
            (
                r36[(1, 2)].atan2(r36[(0, 2)]),
                sin5.atan2(r36[(2, 2)]),
                r36[(2, 1)].atan2(-r36[(2, 0)]),
            )
        } else if r36[(2, 2)] > 0.0 {
            trace!("Wrist singular (joint 5 at zero)");
            (0.0, 0.0, r36[(1, 0)].atan2(r36[(0, 0)]))
        } else {
            trace!("Wrist singular (joint 5 at pi)");
            (0.0, PI, r36[(0, 1)].atan2(-r36[(0, 0)]))
        };

        joints[3] = wrap_to_pi(th4 - self.dh[3].theta);
        joints[4] = wrap_to_pi(th5 - self.dh[4].theta);
        joints[5] = wrap_to_pi(th6 - self.dh[5].theta);

        Ok(joints)
    }

    /// Damped Newton iterations on the pose error of the full chain.
    fn refine(&self, target: &Matrix4<f64>, seed: JointVector) -> Result<JointVector, KinError> {
        let mut joints = seed;
        let mut err = self.pose_error(target, &joints);

        for i in 0..IK_MAX_ITERATIONS {
            if within(&err, IK_STOP_MM, IK_STOP_RAD) {
                break;
            }

            let jac = self.jacobian(&joints);
            let jt = jac.transpose();
            let step = match (jt * jac + Matrix6::identity() * IK_DAMPING).cholesky() {
                Some(c) => c.solve(&(jt * err)),
                None => break,
            };

            for (q, dq) in joints.iter_mut().zip(step.iter()) {
                *q += dq;
            }
            err = self.pose_error(target, &joints);

            trace!(
                "IK refinement {}: {:.3e} mm, {:.3e} rad",
                i,
                err.fixed_rows::<3>(0).norm(),
                err.fixed_rows::<3>(3).norm()
            );
        }

        if !within(&err, IK_ACCEPT_MM, IK_ACCEPT_RAD) {
            return Err(KinError::NotConverged {
                position_mm: err.fixed_rows::<3>(0).norm(),
                angle_rad: err.fixed_rows::<3>(3).norm(),
            });
        }

        Ok(joints.map(wrap_to_pi))
    }

    /// Position and rotation vector taking the tool from `joints` to
    /// `target`, both in the base frame.
    fn pose_error(&self, target: &Matrix4<f64>, joints: &JointVector) -> Vector6<f64> {
        let t = self.forward_matrix(joints);
        let dp = target.fixed_view::<3, 1>(0, 3) - t.fixed_view::<3, 1>(0, 3);
        let dr = relative_rotation(target, &t);

        Vector6::new(dp[0], dp[1], dp[2], dr.x, dr.y, dr.z)
    }

    /// Jacobian of the tool's position and base-frame angular velocity.
    fn jacobian(&self, joints: &JointVector) -> Matrix6<f64> {
        let mut jac = Matrix6::zeros();

        for j in 0..NUM_JOINTS {
            let mut plus = *joints;
            plus[j] += IK_FD_STEP;
            let mut minus = *joints;
            minus[j] -= IK_FD_STEP;

            let tp = self.forward_matrix(&plus);
            let tm = self.forward_matrix(&minus);

            let dp = (tp.fixed_view::<3, 1>(0, 3) - tm.fixed_view::<3, 1>(0, 3))
                / (2.0 * IK_FD_STEP);
            let dr = relative_rotation(&tp, &tm) / (2.0 * IK_FD_STEP);

            jac.fixed_view_mut::<3, 1>(0, j).copy_from(&dp);
            jac.fixed_view_mut::<3, 1>(3, j).copy_from(&dr);
        }

        jac
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Rotation vector of `R_to * R_from^T`.
///
/// The angle is taken with `atan2` of the skew and symmetric parts, which
/// keeps it accurate down to rounding for small rotations.
fn relative_rotation(to: &Matrix4<f64>, from: &Matrix4<f64>) -> Vector3<f64> {
    let r_to: Matrix3<f64> = to.fixed_view::<3, 3>(0, 0).into_owned();
    let r_from: Matrix3<f64> = from.fixed_view::<3, 3>(0, 0).into_owned();
    let r = r_to * r_from.transpose();

    // sin(angle) * axis
    let skew = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    ) * 0.5;
    let sin = skew.norm();
    if sin < f64::EPSILON {
        return skew;
    }

    let cos = (r.trace() - 1.0) * 0.5;
    skew * (sin.atan2(cos) / sin)
}

fn within(err: &Vector6<f64>, tol_mm: f64, tol_rad: f64) -> bool {
    err.fixed_rows::<3>(0).norm() < tol_mm && err.fixed_rows::<3>(3).norm() < tol_rad
}

fn validate_dh(dh: &DhSet) -> Result<(), KinError> {
    if let Some(i) = dh.iter().position(|p| !p.is_finite()) {
        return Err(KinError::InvalidParams(format!(
            "DH parameters of joint {} are not finite",
            i
        )));
    }

    if dh[1].a <= 0.0 || dh[3].d <= 0.0 {
        return Err(KinError::InvalidParams(
            "upper arm (a2) and forearm (d4) lengths must be positive".into(),
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn model() -> KinematicModel {
        KinematicModel::new(&KinParams::default()).unwrap()
    }

    /// Evenly spaced values over a range, inclusive.
    fn grid(min: f64, max: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| min + (max - min) * i as f64 / (n - 1) as f64)
            .collect()
    }

    #[test]
    fn test_forward_at_zero() {
        let pose = model().forward(&[0.0; NUM_JOINTS]);

        // Upper arm vertical, forearm and tool pointing along base x
        assert_abs_diff_eq!(pose.x, 160.0 + 40.0 + 45.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.y, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(pose.z, 105.0 + 160.0, epsilon = 1e-9);

        let approach = pose.rotation() * Vector3::z();
        assert_abs_diff_eq!(approach, Vector3::x(), epsilon = 1e-9);
    }

    #[test]
    fn test_forward_inverse_round_trip() {
        let model = model();
        let mut count = 0;

        for q1 in grid(-2.5, 2.5, 5) {
            for q2 in grid(-1.0, 0.0, 3) {
                for q3 in grid(-0.5, 1.0, 4) {
                    for q4 in grid(-2.5, 2.5, 3) {
                        for q5 in grid(0.2, 1.5, 3) {
                            for q6 in grid(-2.5, 2.5, 3) {
                                let joints = [q1, q2, q3, q4, q5, q6];
                                let pose = model.forward(&joints);

                                let solved = model.inverse(&pose).unwrap();
                                for i in 0..NUM_JOINTS {
                                    assert_abs_diff_eq!(solved[i], joints[i], epsilon = 1e-6);
                                }

                                let back = model.forward(&solved);
                                assert!(back.distance_mm(&pose) < 1e-6);
                                assert!(back.angle_to_rad(&pose) < 1e-6);

                                count += 1;
                            }
                        }
                    }
                }
            }
        }

        assert_eq!(count, 5 * 3 * 4 * 3 * 3 * 3);
    }

    #[test]
    fn test_round_trip_on_calibrated_set() {
        // Deviations of the kind a calibration finds, none of which the
        // closed-form solution accounts for
        let mut params = KinParams::default();
        params.dh[0].a += 0.8;
        params.dh[1].d += 0.5;
        params.dh[1].alpha -= 0.008;
        params.dh[2].a -= 0.7;
        params.dh[2].d += 0.3;
        params.dh[3].a += 0.4;
        params.dh[4].d -= 0.2;
        params.dh[4].alpha += 0.005;
        params.dh[5].a += 0.3;
        let model = KinematicModel::new(&params).unwrap();

        let poses = [
            [0.3, -0.4, 0.5, 0.7, 0.9, -0.2],
            [-1.2, -0.8, 0.2, -1.5, 0.4, 2.0],
            [2.0, -0.1, 0.9, 0.3, 1.3, 0.0],
            [0.0, -0.6, -0.3, 0.0, 0.3, 0.8],
        ];

        for joints in poses.iter() {
            let pose = model.forward(joints);
            let solved = model.inverse(&pose).unwrap();

            let back = model.forward(&solved);
            assert!(back.distance_mm(&pose) < 1e-6);
            assert!(back.angle_to_rad(&pose) < 1e-6);

            // Same branch as the pose was generated from
            for i in 0..NUM_JOINTS {
                assert_abs_diff_eq!(solved[i], joints[i], epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_relative_rotation() {
        let axis = nalgebra::Vector3::new(1.0, -2.0, 0.5).normalize();
        let identity = Matrix4::identity();

        for angle in [1e-11, 1e-6, 0.3, 3.0].iter() {
            let rot = nalgebra::Rotation3::from_scaled_axis(axis * *angle).to_homogeneous();
            let v = relative_rotation(&rot, &identity);

            assert_abs_diff_eq!(v.norm(), *angle, epsilon = 1e-15 + 1e-12 * angle);
            assert_abs_diff_eq!(v.normalize(), axis, epsilon = 1e-4);
        }

        assert_eq!(relative_rotation(&identity, &identity), Vector3::zeros());
    }

    #[test]
    fn test_inverse_singular_wrist() {
        let model = model();

        // Joint 5 at zero aligns joints 4 and 6, the solver puts all of the
        // rotation on joint 6
        let joints = [0.3, -0.4, 0.5, 0.7, 0.0, -0.2];
        let pose = model.forward(&joints);
        let solved = model.inverse(&pose).unwrap();

        assert_abs_diff_eq!(solved[3], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solved[4], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solved[5], 0.5, epsilon = 1e-6);
        assert!(model.forward(&solved).distance_mm(&pose) < 1e-6);
        assert!(model.forward(&solved).angle_to_rad(&pose) < 1e-6);
    }

    #[test]
    fn test_inverse_unreachable() {
        let model = model();

        // Further than the arm can stretch
        let pose = Pose6D::new(600.0, 0.0, 100.0, PI, 0.0, 0.0);
        assert!(matches!(model.inverse(&pose), Err(KinError::Unreachable(_))));

        let pose = Pose6D::new(f64::NAN, 0.0, 100.0, PI, 0.0, 0.0);
        assert!(matches!(model.inverse(&pose), Err(KinError::InvalidParams(_))));
    }

    #[test]
    fn test_inverse_joint_limit() {
        let model = model();

        // Reachable only with the shoulder leaning back beyond its limit
        let pose = Pose6D::new(-60.0, 0.0, -120.0, PI, 0.0, 0.0);
        assert!(matches!(
            model.inverse(&pose),
            Err(KinError::JointLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_set_dh_parameters() {
        let mut model = model();

        let mut dh = *model.dh_parameters();
        dh[1].a = 165.0;
        model.set_dh_parameters(dh).unwrap();
        assert_eq!(model.dh_parameters()[1].a, 165.0);

        // Invalid sets are rejected and the previous set retained
        dh[3].d = f64::NAN;
        assert!(model.set_dh_parameters(dh).is_err());
        assert_eq!(model.dh_parameters()[3].d, 160.0);

        // The joint 2 offset keeps the upper arm vertical at zero
        assert_abs_diff_eq!(model.dh_parameters()[1].theta, FRAC_PI_2);
    }
}
