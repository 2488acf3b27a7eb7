//! Implementations for the ArmCtrl state structure

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use comms_if::eqpt::arm::{self, ArmStatus, ControlCmd};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use util::time::seconds_to_std;

// Internal
use super::{ArmCtrlError, Params, Square};
use crate::dev_link::{DeviceLink, LinkError, StopHandle};
use crate::kin::{DhSet, JointVector, KinematicModel, Pose6D, NUM_JOINTS};
use crate::traj_plan::{PlanError, TrajPlanner};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Arm control module state
pub struct ArmCtrl {
    params: Params,

    model: KinematicModel,

    planner: TrajPlanner,

    link: DeviceLink,

    state: RobotState,

    /// Copy of `state` for readers on other threads
    status_board: Arc<RwLock<RobotState>>,

    /// Nesting depth of the operation being executed
    op_depth: usize,

    /// Stop epoch captured when the outermost operation started
    op_epoch: u64,
}

/// State of the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub mode: ArmMode,

    pub connected: bool,

    pub moving: bool,

    /// Pose of the tool centre point, always the forward kinematics of
    /// `current_joints`
    pub current_position: Pose6D,

    /// Last joint positions acknowledged by the firmware
    ///
    /// Units: radians
    pub current_joints: JointVector,

    pub gripper_closed: bool,

    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Modes of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmMode {
    Disconnected,
    Connecting,
    Connected,
    Idle,
    Moving,
    Error,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl RobotState {
    /// Serialisable status for publishing.
    pub fn to_status(&self) -> ArmStatus {
        ArmStatus {
            mode: format!("{:?}", self.mode),
            connected: self.connected,
            moving: self.moving,
            current_position: self.current_position.to_array(),
            current_joints_rad: self.current_joints,
            gripper_closed: self.gripper_closed,
            last_error: self.last_error.clone(),
        }
    }
}

impl ArmCtrl {
    /// Create the controller. The link is not opened until
    /// [`ArmCtrl::initialize`] is called.
    pub fn new(params: Params, link: DeviceLink) -> Result<Self, ArmCtrlError> {
        params.are_valid()?;

        let model = KinematicModel::new(&params.kin)?;
        let planner = TrajPlanner::new(*model.limits());

        let joints = [0.0; NUM_JOINTS];
        let state = RobotState {
            mode: ArmMode::Disconnected,
            connected: false,
            moving: false,
            current_position: model.forward(&joints),
            current_joints: joints,
            gripper_closed: false,
            last_error: None,
        };

        Ok(Self {
            params,
            model,
            planner,
            link,
            status_board: Arc::new(RwLock::new(state.clone())),
            state,
            op_depth: 0,
            op_epoch: 0,
        })
    }

    // ---- ACCESSORS ----

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn model(&self) -> &KinematicModel {
        &self.model
    }

    /// Copy of the current state.
    pub fn status(&self) -> RobotState {
        self.state.clone()
    }

    /// Shared copy of the state, updated on every state change.
    pub fn status_board(&self) -> Arc<RwLock<RobotState>> {
        self.status_board.clone()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.link.stop_handle()
    }

    /// Stop epoch of the link.
    pub fn stop_epoch(&self) -> u64 {
        self.link.epoch()
    }

    /// Install a new DH set, replacing the previous one as a whole.
    pub fn set_dh_parameters(&mut self, dh: DhSet) -> Result<(), ArmCtrlError> {
        self.model.set_dh_parameters(dh)?;

        self.state.current_position = self.model.forward(&self.state.current_joints);
        self.commit();

        info!("New DH parameters installed");

        Ok(())
    }

    /// Pose of the tool over the centre of a square at the given height.
    pub fn square_pose(&self, square: Square, height_mm: f64) -> Pose6D {
        let (x, y) = self.params.board.square_centre(square);
        let [rx, ry, rz] = self.params.grasp_orientation_rad;

        Pose6D::new(x, y, height_mm, rx, ry, rz)
    }

    // ---- CONNECTION ----

    /// Open the link to the firmware.
    ///
    /// On failure the controller stays disconnected and the error is
    /// recorded in the state.
    pub fn initialize(&mut self) -> Result<(), ArmCtrlError> {
        self.set_mode(ArmMode::Connecting);

        match self.link.open() {
            Ok(()) => {
                self.state.connected = true;
                self.set_mode(ArmMode::Connected);
                self.set_mode(ArmMode::Idle);
                info!("Arm initialised");
                Ok(())
            }
            Err(e) => {
                let e = ArmCtrlError::from(e);
                error!("Arm initialisation failed: {}", e);
                self.state.connected = false;
                self.state.last_error = Some(e.to_string());
                self.set_mode(ArmMode::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the link to the firmware.
    pub fn disconnect(&mut self) {
        self.link.close();
        self.state.connected = false;
        self.state.moving = false;
        self.set_mode(ArmMode::Disconnected);
    }

    // ---- MOTION ----

    /// Raise the tool to the safe height if it is below it, then move to the
    /// zero joint position.
    pub fn home(&mut self) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            ctrl.ensure_ready()?;

            let safe_height_mm = ctrl.params.safe_height_mm;
            let current = ctrl.state.current_position;

            if current.z < safe_height_mm {
                debug!("Raising to {} mm before homing", safe_height_mm);
                let raised = ctrl.model.inverse(&current.with_z(safe_height_mm))?;
                ctrl.run_trajectory(&raised)?;
            }

            ctrl.run_trajectory(&[0.0; NUM_JOINTS])?;
            info!("Arm homed");

            Ok(())
        })
    }

    /// Move the tool over a square at the given height.
    pub fn move_to_square(&mut self, square: &str, height_mm: f64) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            let square: Square = square.parse()?;
            debug!("Moving to {} at {} mm", square, height_mm);

            let pose = ctrl.square_pose(square, height_mm);
            ctrl.move_to_pose(&pose)
        })
    }

    /// Move the tool centre point to a pose along a joint space trajectory.
    pub fn move_to_pose(&mut self, pose: &Pose6D) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            ctrl.ensure_ready()?;

            let target = ctrl.model.inverse(pose)?;
            ctrl.run_trajectory(&target)
        })
    }

    /// Move the joints to the given positions along a planned trajectory.
    pub fn move_to_joints(&mut self, target: &JointVector) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| ctrl.run_trajectory(target))
    }

    /// Move the joints directly to the given positions with a single
    /// `MOVE_JOINT` command, leaving the interpolation to the firmware.
    pub fn jog_to_joints(&mut self, target: &JointVector, speed_pct: u8) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            ctrl.ensure_ready()?;
            ctrl.planner.validate(target)?;

            ctrl.state.moving = true;
            ctrl.set_mode(ArmMode::Moving);

            let cmd = ControlCmd::MoveJoint {
                joints_deg: to_degrees(target),
                speed_pct,
            };
            let sent = ctrl
                .link
                .send_command(&cmd.to_line(), ctrl.op_epoch)
                .and_then(|_| {
                    ctrl.link
                        .settle(seconds_to_std(ctrl.params.jog_settle_s), ctrl.op_epoch)
                });

            match sent {
                Ok(()) => {
                    ctrl.finish_motion(target);
                    Ok(())
                }
                Err(e) => {
                    let e = ArmCtrlError::from(e);
                    ctrl.abandon_motion(&e);
                    Err(e)
                }
            }
        })
    }

    /// Pick up the piece on a square.
    pub fn pick(&mut self, square: &str) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            square.parse::<Square>()?;
            let (safe, grasp) = (ctrl.params.safe_height_mm, ctrl.params.grasp_height_mm);

            ctrl.move_to_square(square, safe)?;
            ctrl.move_to_square(square, grasp)?;
            ctrl.gripper_control(true)?;
            ctrl.move_to_square(square, safe)?;

            info!("Picked from {}", square);

            Ok(())
        })
    }

    /// Place the held piece on a square.
    ///
    /// If lowering or releasing the piece fails the tool is raised back to
    /// the safe height over the square, on a best effort basis.
    pub fn place(&mut self, square: &str) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            square.parse::<Square>()?;
            let (safe, grasp) = (ctrl.params.safe_height_mm, ctrl.params.grasp_height_mm);

            ctrl.move_to_square(square, safe)?;

            let placed = ctrl
                .move_to_square(square, grasp)
                .and_then(|_| ctrl.gripper_control(false));

            if let Err(e) = placed {
                if !e.is_abort() {
                    warn!("Placing on {} failed ({}), raising the tool", square, e);
                    if let Err(re) = ctrl.move_to_square(square, safe) {
                        warn!("Could not raise the tool over {}: {}", square, re);
                    }
                }
                return Err(e);
            }

            ctrl.move_to_square(square, safe)?;

            info!("Placed on {}", square);

            Ok(())
        })
    }

    /// Move a piece between two squares.
    ///
    /// If the piece cannot be placed on the destination it is put back on
    /// the source square. The result reflects the destination placement
    /// only, whether or not the piece was put back.
    pub fn execute_move(&mut self, from: &str, to: &str) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            let from_sq: Square = from.parse()?;
            let to_sq: Square = to.parse()?;

            info!("Executing move {} -> {}", from_sq, to_sq);

            ctrl.pick(from)?;

            if let Err(e) = ctrl.place(to) {
                if e.is_abort() {
                    return Err(e);
                }

                warn!("Could not place on {} ({}), returning the piece to {}", to_sq, e, from_sq);
                match ctrl.place(from) {
                    Ok(()) => info!("Piece returned to {}", from_sq),
                    Err(re) => error!("Could not return the piece to {}: {}", from_sq, re),
                }

                return Err(e);
            }

            info!("Move {} -> {} complete", from_sq, to_sq);

            Ok(())
        })
    }

    /// Open or close the gripper.
    pub fn gripper_control(&mut self, close: bool) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            ctrl.ensure_ready()?;

            let cmd = if close {
                ControlCmd::GripClose
            } else {
                ControlCmd::GripOpen
            };

            ctrl.link.send_command(&cmd.to_line(), ctrl.op_epoch)?;
            ctrl.link
                .settle(seconds_to_std(ctrl.params.gripper_settle_s), ctrl.op_epoch)?;

            ctrl.state.gripper_closed = close;
            ctrl.commit();
            debug!("Gripper {}", if close { "closed" } else { "open" });

            Ok(())
        })
    }

    // ---- STOP ----

    /// Stop the arm immediately.
    ///
    /// The controller always ends up not moving, and idle if connected. The
    /// error is only returned when the firmware did not acknowledge the stop.
    pub fn emergency_stop(&mut self) -> Result<(), ArmCtrlError> {
        let outcome = self.link.stop_handle().trigger();
        self.apply_stop(outcome)
    }

    /// Update the state after a stop was sent through a [`StopHandle`].
    pub fn apply_stop(&mut self, outcome: Result<(), LinkError>) -> Result<(), ArmCtrlError> {
        self.state.moving = false;
        if self.state.connected {
            self.set_mode(ArmMode::Idle);
        }

        match outcome {
            Ok(()) => {
                info!("Emergency stop acknowledged");
                self.commit();
                Ok(())
            }
            Err(e) => {
                let e = ArmCtrlError::StopNotAcknowledged(e);
                error!("{}", e);
                self.state.last_error = Some(e.to_string());
                self.commit();
                Err(e)
            }
        }
    }

    // ---- FIRMWARE QUERIES ----

    /// Read the joint positions reported by the firmware.
    pub fn read_joint_positions(&mut self) -> Result<JointVector, ArmCtrlError> {
        self.scoped(|ctrl| {
            ctrl.ensure_ready()?;

            let reply = ctrl
                .link
                .query(&ControlCmd::GetJointPos.to_line(), ctrl.op_epoch)?;
            let joints_deg = arm::parse_joint_positions(&reply)?;

            Ok(joints_deg.map(f64::to_radians))
        })
    }

    /// Make the firmware latch the current joint positions as zero.
    pub fn set_home(&mut self) -> Result<(), ArmCtrlError> {
        self.scoped(|ctrl| {
            ctrl.ensure_ready()?;

            ctrl.link
                .send_command(&ControlCmd::SetHome.to_line(), ctrl.op_epoch)?;

            ctrl.finish_motion(&[0.0; NUM_JOINTS]);
            info!("Current position latched as home");

            Ok(())
        })
    }

    // ---- PRIVATE ----

    /// Run an operation. The outermost operation captures the stop epoch
    /// and records its failure in the state.
    fn scoped<T, F>(&mut self, op: F) -> Result<T, ArmCtrlError>
    where
        F: FnOnce(&mut Self) -> Result<T, ArmCtrlError>,
    {
        if self.op_depth == 0 {
            self.op_epoch = self.link.epoch();
        }

        self.op_depth += 1;
        let result = op(self);
        self.op_depth -= 1;

        if self.op_depth == 0 {
            if let Err(ref e) = result {
                self.record_failure(e);
            }
        }

        result
    }

    fn ensure_ready(&self) -> Result<(), ArmCtrlError> {
        match self.state.mode {
            ArmMode::Idle | ArmMode::Error if self.state.connected => Ok(()),
            mode => Err(ArmCtrlError::NotConnected(mode)),
        }
    }

    /// Plan a move to the target joints and send it waypoint by waypoint.
    fn run_trajectory(&mut self, target: &JointVector) -> Result<(), ArmCtrlError> {
        self.ensure_ready()?;

        // Rejected before anything is sent
        self.planner.validate(target)?;
        let path = self
            .planner
            .plan(&self.state.current_joints, target, self.params.traj_steps)?;

        self.state.moving = true;
        self.set_mode(ArmMode::Moving);

        match self.dispatch(&path) {
            Ok(()) => {
                self.finish_motion(target);
                Ok(())
            }
            Err(e) => {
                self.abandon_motion(&e);
                Err(e)
            }
        }
    }

    fn dispatch(&mut self, path: &[JointVector]) -> Result<(), ArmCtrlError> {
        let settle = seconds_to_std(self.params.waypoint_settle_s);

        for (index, waypoint) in path.iter().enumerate() {
            self.planner
                .validate(waypoint)
                .map_err(|source| PlanError::InvalidWaypoint { index, source })?;

            let frame = arm::encode_joint_frame(&to_degrees(waypoint), self.params.frame_duration_ms);
            trace!("Waypoint {}/{}: {}", index, path.len() - 1, frame);

            self.link.send_command(&frame, self.op_epoch)?;
            self.state.current_joints = *waypoint;

            self.link.settle(settle, self.op_epoch)?;
        }

        Ok(())
    }

    /// Record a completed motion.
    fn finish_motion(&mut self, joints: &JointVector) {
        self.state.current_joints = *joints;
        self.state.current_position = self.model.forward(joints);
        self.state.moving = false;
        self.set_mode(ArmMode::Idle);
    }

    /// Record a motion that failed part way. The joints are left at the last
    /// acknowledged waypoint.
    fn abandon_motion(&mut self, e: &ArmCtrlError) {
        self.state.current_position = self.model.forward(&self.state.current_joints);
        self.state.moving = false;
        self.set_failure_mode(e);
    }

    fn record_failure(&mut self, e: &ArmCtrlError) {
        self.state.moving = false;
        self.state.last_error = Some(e.to_string());
        self.set_failure_mode(e);

        warn!("Arm operation failed: {}", e);
    }

    /// Rejected and aborted operations leave the arm usable, anything else
    /// puts it in error. The mode of a disconnected arm is left alone.
    fn set_failure_mode(&mut self, e: &ArmCtrlError) {
        if !self.state.connected {
            self.commit();
        } else if e.is_abort() || e.kind().is_rejection() {
            self.set_mode(ArmMode::Idle);
        } else {
            self.set_mode(ArmMode::Error);
        }
    }

    fn set_mode(&mut self, mode: ArmMode) {
        if self.state.mode != mode {
            debug!("ArmCtrl mode {:?} -> {:?}", self.state.mode, mode);
            self.state.mode = mode;
        }
        self.commit();
    }

    /// Publish the state to the status board.
    fn commit(&self) {
        match self.status_board.write() {
            Ok(mut s) => *s = self.state.clone(),
            Err(_) => warn!("ArmCtrl status board is poisoned"),
        }
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

fn to_degrees(joints: &JointVector) -> [f64; NUM_JOINTS] {
    joints.map(f64::to_degrees)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
