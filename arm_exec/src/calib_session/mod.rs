//! # Calibration session
//!
//! Drives the arm through a set of sampling poses, collects measurements from
//! the metrology or the camera and hands them to the estimators in
//! [`crate::calib`]. Successful results are installed in the controller's
//! kinematic model and saved into the session directory.
//!
//! A session borrows the controller exclusively, so no other command can move
//! the arm while it runs.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::eqpt::vision::{MeasuredPoint, TargetPose};
use comms_if::net::{ArmEvent, CalibKind, Publisher};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use util::maths::{halton, lin_map};
use util::session;

use crate::arm_ctrl::ArmCtrl;
use crate::calib::{
    self, CalibError, CalibSample, DhArtifact, DhRefineParams, DhRefinement, HandEyeArtifact,
    HandEyeCalibration, HandEyeParams, HandEyeSample, DH_ARTIFACT_PATH, HAND_EYE_ARTIFACT_PATH,
};
use crate::kin::{JointVector, Pose6D, NUM_JOINTS};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Halton bases of the joints, one prime per joint.
const HALTON_BASES: [usize; NUM_JOINTS] = [2, 3, 5, 7, 11, 13];

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// Source of tool position measurements.
pub trait Metrology {
    /// Measure the tool centre point with the arm at `joints`. `theoretical`
    /// is the pose predicted by the current model, for display to an
    /// operator. `None` skips the sample.
    fn measure_tcp(&mut self, joints: &JointVector, theoretical: &Pose6D) -> Option<MeasuredPoint>;
}

/// Detector of the calibration target in the gripper camera's images.
pub trait TargetDetector {
    /// Pose of the target in the camera frame, `None` if it is not visible.
    fn detect_target(&mut self) -> Option<TargetPose>;
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters of a calibration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibSessionParams {
    /// Number of poses sampled for the DH refinement
    pub dh_num_samples: usize,

    /// Number of poses sampled for the hand-eye calibration
    pub hand_eye_num_samples: usize,

    /// Fraction of each joint's range the sampled poses are drawn from
    pub sample_range_scale: f64,

    /// Save successful results into the session directory
    pub save_artifacts: bool,

    pub dh_refine: DhRefineParams,

    pub hand_eye: HandEyeParams,
}

/// A calibration session in progress.
pub struct CalibSession<'a> {
    ctrl: &'a mut ArmCtrl,
    params: CalibSessionParams,
    publisher: Option<Box<dyn Publisher>>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for CalibSessionParams {
    fn default() -> Self {
        Self {
            dh_num_samples: 50,
            hand_eye_num_samples: 15,
            sample_range_scale: 0.7,
            save_artifacts: true,
            dh_refine: DhRefineParams::default(),
            hand_eye: HandEyeParams::default(),
        }
    }
}

impl<'a> CalibSession<'a> {
    pub fn new(ctrl: &'a mut ArmCtrl, params: CalibSessionParams) -> Self {
        Self {
            ctrl,
            params,
            publisher: None,
        }
    }

    /// Announce completed calibrations on the given publisher.
    pub fn with_publisher(mut self, publisher: Box<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn params(&self) -> &CalibSessionParams {
        &self.params
    }

    /// `n` joint vectors spread evenly over the scaled joint ranges.
    ///
    /// The sequence is deterministic, the same `n` always gives the same
    /// poses and a longer sequence starts with the shorter one.
    pub fn sample_joint_sets(&self, n: usize) -> Vec<JointVector> {
        let limits = self.ctrl.model().limits();
        let scale = self.params.sample_range_scale;

        (1..=n)
            .map(|i| {
                let mut joints = [0.0; NUM_JOINTS];
                for (j, q) in joints.iter_mut().enumerate() {
                    *q = lin_map(
                        (0.0, 1.0),
                        (scale * limits.min_rad[j], scale * limits.max_rad[j]),
                        halton(i, HALTON_BASES[j]),
                    );
                }
                joints
            })
            .collect()
    }

    /// Visit `n` sampled poses and measure the tool at each.
    pub fn collect_dh_samples(
        &mut self,
        metrology: &mut dyn Metrology,
        n: usize,
    ) -> Result<Vec<CalibSample>, CalibError> {
        let mut samples = Vec::with_capacity(n);

        for (i, joints) in self.sample_joint_sets(n).iter().enumerate() {
            self.jog(joints)?;

            let theoretical = self.ctrl.model().forward(joints);
            match metrology.measure_tcp(joints, &theoretical) {
                Some(p) => {
                    debug!(
                        "Sample {}: model {:?}, measured {:?}",
                        i,
                        theoretical.position(),
                        p
                    );
                    samples.push(CalibSample::new(*joints, &theoretical.position(), &p));
                }
                None => warn!("No measurement for sample {}, skipping it", i),
            }
        }

        info!("Collected {} of {} DH samples", samples.len(), n);

        Ok(samples)
    }

    /// Refine the DH parameters from measured samples and install them.
    ///
    /// On any failure the current parameters are left untouched.
    pub fn calibrate_dh(
        &mut self,
        metrology: &mut dyn Metrology,
    ) -> Result<DhRefinement, CalibError> {
        info!("Starting DH calibration");

        let samples = self.collect_dh_samples(metrology, self.params.dh_num_samples)?;

        let model = self.ctrl.model();
        let result = calib::refine_dh(
            model.dh_parameters(),
            model.tool_offset(),
            &samples,
            &self.params.dh_refine,
        )?;

        self.ctrl.set_dh_parameters(result.dh)?;

        if self.params.save_artifacts {
            session::save_with_timestamp(DH_ARTIFACT_PATH, DhArtifact::from_model(self.ctrl.model()));
        }
        self.publish(CalibKind::DhParameters, Some(result.mean_error_mm));

        Ok(result)
    }

    /// Register the gripper camera from target detections at sampled poses.
    pub fn calibrate_hand_eye(
        &mut self,
        detector: &mut dyn TargetDetector,
    ) -> Result<HandEyeCalibration, CalibError> {
        info!("Starting hand-eye calibration");

        let n = self.params.hand_eye_num_samples;
        let mut samples = Vec::with_capacity(n);

        for (i, joints) in self.sample_joint_sets(n).iter().enumerate() {
            self.jog(joints)?;

            match detector.detect_target() {
                Some(target) => samples.push(HandEyeSample::new(
                    self.ctrl.model().forward_matrix(joints),
                    &target,
                )),
                None => warn!("Target not visible at sample {}, skipping it", i),
            }
        }

        let result = calib::calibrate_hand_eye(&samples, &self.params.hand_eye)?;

        if self.params.save_artifacts {
            session::save_with_timestamp(
                HAND_EYE_ARTIFACT_PATH,
                HandEyeArtifact::new(&result.gripper_t_camera),
            );
        }
        self.publish(CalibKind::HandEye, Some(result.mean_translation_error_mm));

        Ok(result)
    }

    /// Latch the arm's current position as the joint zero.
    ///
    /// Returns the joint positions the firmware reported before they were
    /// zeroed.
    pub fn calibrate_home(&mut self) -> Result<JointVector, CalibError> {
        let joints = self.ctrl.read_joint_positions()?;
        self.ctrl.set_home()?;

        info!("Home position set, previous joints {:?} rad", joints);
        self.publish(CalibKind::Home, None);

        Ok(joints)
    }

    /// Error between the model's tool position and the measured one at each
    /// of the given poses. Poses without a measurement are left out.
    pub fn verify(
        &mut self,
        metrology: &mut dyn Metrology,
        joint_sets: &[JointVector],
    ) -> Result<Vec<f64>, CalibError> {
        let mut errors = Vec::with_capacity(joint_sets.len());

        for (i, joints) in joint_sets.iter().enumerate() {
            self.jog(joints)?;

            let predicted = self.ctrl.model().forward(joints);
            match metrology.measure_tcp(joints, &predicted) {
                Some(p) => {
                    let err = (predicted.position() - nalgebra::Vector3::from(p.to_array())).norm();
                    debug!("Verification pose {}: error {:.3} mm", i, err);
                    errors.push(err);
                }
                None => warn!("No measurement for verification pose {}", i),
            }
        }

        if !errors.is_empty() {
            let mean = errors.iter().sum::<f64>() / errors.len() as f64;
            let max = errors.iter().cloned().fold(0.0, f64::max);
            info!(
                "Verified {} poses, mean error {:.3} mm, max error {:.3} mm",
                errors.len(),
                mean,
                max
            );
        }

        Ok(errors)
    }

    fn jog(&mut self, joints: &JointVector) -> Result<(), CalibError> {
        let speed_pct = self.ctrl.params().jog_speed_pct;
        self.ctrl.jog_to_joints(joints, speed_pct)?;

        Ok(())
    }

    fn publish(&self, kind: CalibKind, mean_error_mm: Option<f64>) {
        if let Some(ref p) = self.publisher {
            if let Err(e) = p.publish(ArmEvent::CalibrationCompleted {
                kind,
                mean_error_mm,
            }) {
                debug!("Could not publish calibration event: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::arm_ctrl::Params;
    use crate::dev_link::{DeviceLink, LinkParams, SimHandle, SimTransport};
    use crate::kin::{tcp_position, DhSet, DEFAULT_DH};
    use approx::assert_abs_diff_eq;
    use comms_if::net::{local_bus, Subscriber};
    use nalgebra::{Isometry3, Vector3};

    /// Measures the tool of an arm built to the given geometry.
    struct TrueArm {
        dh: DhSet,
        tool: Vector3<f64>,
        visits: usize,
        skip_every: Option<usize>,
    }

    impl TrueArm {
        fn new(dh: DhSet) -> Self {
            Self {
                dh,
                tool: Vector3::from(Params::default().kin.tool_offset_mm),
                visits: 0,
                skip_every: None,
            }
        }
    }

    impl Metrology for TrueArm {
        fn measure_tcp(&mut self, joints: &JointVector, _: &Pose6D) -> Option<MeasuredPoint> {
            self.visits += 1;
            if let Some(n) = self.skip_every {
                if self.visits % n != 0 {
                    return None;
                }
            }

            let p = tcp_position(&self.dh, &self.tool, joints);
            Some(MeasuredPoint::new(p.x, p.y, p.z))
        }
    }

    /// A camera on the gripper looking at a fixed target.
    struct Camera<'a> {
        sim: &'a SimHandle,
        mount: Isometry3<f64>,
        target: Isometry3<f64>,
    }

    impl<'a> TargetDetector for Camera<'a> {
        fn detect_target(&mut self) -> Option<TargetPose> {
            let model = crate::kin::KinematicModel::new(&Params::default().kin).ok()?;
            let joints = self.sim.joints_deg().map(f64::to_radians);
            let gripper = model.forward(&joints).to_isometry();

            let m = (self.mount.inverse() * gripper.inverse() * self.target).to_homogeneous();
            let mut cam_t_target = [[0.0; 4]; 4];
            for (r, row) in cam_t_target.iter_mut().enumerate() {
                for (c, v) in row.iter_mut().enumerate() {
                    *v = m[(r, c)];
                }
            }

            Some(TargetPose { cam_t_target })
        }
    }

    fn session_params() -> CalibSessionParams {
        CalibSessionParams {
            dh_num_samples: 25,
            hand_eye_num_samples: 8,
            save_artifacts: false,
            ..Default::default()
        }
    }

    fn connected_ctrl() -> (ArmCtrl, SimHandle) {
        let params = Params {
            waypoint_settle_s: 0.0,
            gripper_settle_s: 0.0,
            jog_settle_s: 0.0,
            link: LinkParams {
                ack_timeout_s: 0.2,
                ack_poll_s: 0.002,
                open_settle_s: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };

        let (transport, sim) = SimTransport::new();
        let link = DeviceLink::new(params.link.clone(), Box::new(transport));
        let mut ctrl = ArmCtrl::new(params, link).unwrap();
        ctrl.initialize().unwrap();

        (ctrl, sim)
    }

    #[test]
    fn test_sample_joint_sets() {
        let (mut ctrl, _sim) = connected_ctrl();
        let limits = *ctrl.model().limits();
        let session = CalibSession::new(&mut ctrl, session_params());

        let sets = session.sample_joint_sets(40);
        assert_eq!(sets.len(), 40);
        assert_eq!(&session.sample_joint_sets(10)[..], &sets[..10]);

        for q in sets.iter() {
            for j in 0..NUM_JOINTS {
                assert!(q[j] >= 0.7 * limits.min_rad[j] - 1e-12);
                assert!(q[j] <= 0.7 * limits.max_rad[j] + 1e-12);
            }
        }

        // No two poses are the same
        for a in 0..sets.len() {
            for b in (a + 1)..sets.len() {
                assert_ne!(sets[a], sets[b]);
            }
        }
    }

    #[test]
    fn test_calibrate_dh() {
        let (mut ctrl, sim) = connected_ctrl();

        let mut truth = DEFAULT_DH;
        truth[1].a += 1.5;
        truth[3].d += 2.0;
        let mut arm = TrueArm::new(truth);

        let (publisher, subscriber) = local_bus("calibration_service");
        let mut session =
            CalibSession::new(&mut ctrl, session_params()).with_publisher(Box::new(publisher));

        let result = session.calibrate_dh(&mut arm).unwrap();
        assert!(result.mean_error_mm < 1e-3);
        assert_eq!(sim.count_matching("MOVE_JOINT"), 25);

        match subscriber.try_recv().unwrap().unwrap().event {
            ArmEvent::CalibrationCompleted {
                kind,
                mean_error_mm,
            } => {
                assert_eq!(kind, CalibKind::DhParameters);
                assert!(mean_error_mm.unwrap() < 1e-3);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Installed in the controller's model
        drop(session);
        assert_abs_diff_eq!(ctrl.model().dh_parameters()[1].a, truth[1].a, epsilon = 1e-2);
        assert_abs_diff_eq!(ctrl.model().dh_parameters()[3].d, truth[3].d, epsilon = 1e-2);
    }

    #[test]
    fn test_calibrate_dh_insufficient() {
        let (mut ctrl, _sim) = connected_ctrl();

        let mut truth = DEFAULT_DH;
        truth[1].a += 1.5;
        let mut arm = TrueArm::new(truth);

        // Only one pose in three is measured, leaving 8 of 25
        arm.skip_every = Some(3);

        let mut session = CalibSession::new(&mut ctrl, session_params());
        let err = session.calibrate_dh(&mut arm).unwrap_err();
        assert!(matches!(
            err,
            CalibError::InsufficientData {
                required: 10,
                provided: 8
            }
        ));
        assert_eq!(err.kind(), crate::arm_ctrl::ErrorKind::CalibrationInsufficientData);

        drop(session);
        assert_eq!(*ctrl.model().dh_parameters(), DEFAULT_DH);
    }

    #[test]
    fn test_calibrate_hand_eye() {
        let (mut ctrl, sim) = connected_ctrl();

        let mount = Pose6D::new(20.0, 5.0, 40.0, 0.0, -0.3, 1.57).to_isometry();
        let mut camera = Camera {
            sim: &sim,
            mount,
            target: Pose6D::new(200.0, 0.0, 0.0, 0.0, 0.0, 0.0).to_isometry(),
        };

        let mut session = CalibSession::new(&mut ctrl, session_params());
        let result = session.calibrate_hand_eye(&mut camera).unwrap();

        // The simulated servos quantise the joints, so the camera sees
        // slightly different poses from the commanded ones
        let (got, expected) = (result.gripper_t_camera, mount.to_homogeneous());
        assert_abs_diff_eq!(
            got.fixed_view::<3, 3>(0, 0).into_owned(),
            expected.fixed_view::<3, 3>(0, 0).into_owned(),
            epsilon = 1e-2
        );
        assert_abs_diff_eq!(
            got.fixed_view::<3, 1>(0, 3).into_owned(),
            expected.fixed_view::<3, 1>(0, 3).into_owned(),
            epsilon = 1.0
        );
    }

    #[test]
    fn test_calibrate_home_and_verify() {
        let (mut ctrl, sim) = connected_ctrl();

        ctrl.jog_to_joints(&[0.1, -0.2, 0.3, 0.0, 0.5, 0.0], 50).unwrap();

        let mut session = CalibSession::new(&mut ctrl, session_params());
        let joints = session.calibrate_home().unwrap();
        assert_abs_diff_eq!(joints[2], 0.3, epsilon = 1e-3);
        assert_eq!(sim.joints_deg(), [0.0; NUM_JOINTS]);

        let mut arm = TrueArm::new(DEFAULT_DH);
        let poses = session.sample_joint_sets(5);
        let errors = session.verify(&mut arm, &poses).unwrap();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().all(|e| *e < 1e-9));
    }

    #[test]
    fn test_load_from_toml() {
        let p: CalibSessionParams =
            util::params::parse(include_str!("../../../params/calib_session.toml")).unwrap();
        let d = CalibSessionParams::default();

        assert_eq!(p.dh_num_samples, d.dh_num_samples);
        assert_eq!(p.hand_eye_num_samples, d.hand_eye_num_samples);
        assert_eq!(p.dh_refine, d.dh_refine);
        assert_abs_diff_eq!(
            p.hand_eye.min_pair_rotation_rad,
            d.hand_eye.min_pair_rotation_rad,
            epsilon = 1e-12
        );
    }
}
