//! Calibration of a mis-built arm, from sampling to reloading the saved model

use approx::assert_abs_diff_eq;
use arm_lib::{
    arm_ctrl::{ArmCtrl, ErrorKind, Params},
    calib::{CalibError, DhArtifact},
    calib_session::{CalibSession, CalibSessionParams, Metrology},
    dev_link::{DeviceLink, LinkParams, SimTransport},
    kin::{tcp_position, DhSet, JointVector, Pose6D},
};
use comms_if::eqpt::vision::MeasuredPoint;
use nalgebra::Vector3;

/// A laser tracker measuring an arm whose geometry differs from the nominal.
struct Tracker {
    dh: DhSet,
    tool: Vector3<f64>,
    available: bool,
}

impl Metrology for Tracker {
    fn measure_tcp(&mut self, joints: &JointVector, _: &Pose6D) -> Option<MeasuredPoint> {
        if !self.available {
            return None;
        }

        let p = tcp_position(&self.dh, &self.tool, joints);
        Some(MeasuredPoint::new(p.x, p.y, p.z))
    }
}

fn params() -> Params {
    Params {
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
    }
}

fn connected_ctrl(params: Params) -> ArmCtrl {
    let (transport, _sim) = SimTransport::new();
    let link = DeviceLink::new(params.link.clone(), Box::new(transport));
    let mut ctrl = ArmCtrl::new(params, link).unwrap();
    ctrl.initialize().unwrap();

    ctrl
}

fn as_built() -> Tracker {
    let nominal = params().kin;

    let mut dh = nominal.dh;
    dh[1].a += 2.0;
    dh[3].d -= 1.5;

    Tracker {
        dh,
        tool: Vector3::from(nominal.tool_offset_mm),
        available: true,
    }
}

fn session_params() -> CalibSessionParams {
    CalibSessionParams {
        dh_num_samples: 30,
        save_artifacts: false,
        ..Default::default()
    }
}

#[test]
fn test_calibrate_and_reload() {
    let mut tracker = as_built();
    let mut ctrl = connected_ctrl(params());

    let mut session = CalibSession::new(&mut ctrl, session_params());
    let result = session.calibrate_dh(&mut tracker).unwrap();
    assert!(result.initial_mean_error_mm > 1.0);
    assert!(result.mean_error_mm < 1e-3);

    // Poses the calibration never visited agree with the tracker too
    let unseen: Vec<JointVector> = session.sample_joint_sets(40)[30..].to_vec();
    let errors = session.verify(&mut tracker, &unseen).unwrap();
    assert_eq!(errors.len(), 10);
    assert!(errors.iter().all(|e| *e < 1e-2));

    // Moves planned on the calibrated model put the real tool on target
    for square in ["a1", "h8", "d5"].iter() {
        ctrl.move_to_square(square, 20.0).unwrap();

        let target = ctrl.square_pose(square.parse().unwrap(), 20.0).position();
        let reached = tcp_position(&tracker.dh, &tracker.tool, &ctrl.status().current_joints);
        assert!((reached - target).norm() < 1e-2);
    }

    // Save, reload into fresh parameters and check the model is the same
    let path = std::env::temp_dir()
        .join(format!("arm_exec_calib_it_{}", std::process::id()))
        .join("robot_dh_parameters.json");
    DhArtifact::from_model(ctrl.model()).save(&path).unwrap();

    let mut reloaded = params();
    DhArtifact::load(&path).unwrap().apply_to(&mut reloaded.kin);
    let fresh = connected_ctrl(reloaded);

    for (a, b) in fresh
        .model()
        .dh_parameters()
        .iter()
        .zip(ctrl.model().dh_parameters().iter())
    {
        assert_abs_diff_eq!(a.a, b.a, epsilon = 1e-12);
        assert_abs_diff_eq!(a.d, b.d, epsilon = 1e-12);
        assert_abs_diff_eq!(a.alpha, b.alpha, epsilon = 1e-12);
    }

    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir).ok();
    }
}

#[test]
fn test_calibration_without_measurements() {
    let mut tracker = Tracker {
        available: false,
        ..as_built()
    };
    let mut ctrl = connected_ctrl(params());
    let nominal = *ctrl.model().dh_parameters();

    let mut session = CalibSession::new(&mut ctrl, session_params());
    let err = session.calibrate_dh(&mut tracker).unwrap_err();

    assert!(matches!(
        err,
        CalibError::InsufficientData { provided: 0, .. }
    ));
    assert_eq!(err.kind(), ErrorKind::CalibrationInsufficientData);
    assert_eq!(*ctrl.model().dh_parameters(), nominal);
}
