//! # Arm service
//!
//! Runs [`ArmCtrl`] on a worker thread. Commands are executed one at a time
//! in the order they were submitted. An emergency stop bypasses the queue: it
//! is sent from the caller's thread, aborts the command in progress and
//! flushes every command queued before it.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::net::{ArmEvent, Envelope, Publisher};
use comms_if::tc::arm_ctrl::ArmCmd;
use log::{debug, error, info, warn};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use util::time::seconds_to_std;

use super::{ArmCtrl, ArmCtrlError, RobotState};
use crate::dev_link::{LinkError, StopHandle};
use crate::kin::{JointVector, Pose6D};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Handle to the arm worker thread.
pub struct ArmService {
    worker_jh: Option<JoinHandle<()>>,

    worker_sender: Sender<Job>,

    stop: StopHandle,

    status_board: Arc<RwLock<RobotState>>,

    /// Longest time to wait for the worker to apply a stop
    stop_timeout: Duration,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Successful output of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum CmdOutput {
    Done,

    /// Joint positions read back from the firmware, in radians
    Joints(JointVector),
}

pub type CmdResult = Result<CmdOutput, ArmCtrlError>;

enum Job {
    Initialize {
        reply: Sender<Result<(), ArmCtrlError>>,
    },

    Command {
        cmd: ArmCmd,

        /// Stop epoch when the command was queued
        epoch: u64,

        reply: Option<Sender<CmdResult>>,
    },

    StopApplied {
        outcome: Result<(), LinkError>,
        reply: Sender<Result<(), ArmCtrlError>>,
    },

    Shutdown,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ArmService {
    /// Move the controller onto a new worker thread.
    ///
    /// Command results and status updates are published to `publisher` when
    /// one is given.
    pub fn spawn(
        ctrl: ArmCtrl,
        publisher: Option<Box<dyn Publisher>>,
    ) -> Result<Self, ArmCtrlError> {
        let stop = ctrl.stop_handle();
        let status_board = ctrl.status_board();

        let link = &ctrl.params().link;
        let stop_timeout = link.ack_timeout() * 2
            + seconds_to_std(link.open_settle_s)
            + Duration::from_secs(1);

        let (worker_sender, rx) = channel();

        let worker_jh = thread::Builder::new()
            .name("arm_worker".into())
            .spawn(move || worker_thread(ctrl, rx, publisher))
            .map_err(ArmCtrlError::WorkerSpawnFailed)?;

        Ok(Self {
            worker_jh: Some(worker_jh),
            worker_sender,
            stop,
            status_board,
            stop_timeout,
        })
    }

    /// Connect to the arm, waiting for the outcome.
    pub fn initialize(&self) -> Result<(), ArmCtrlError> {
        let (reply, rx) = channel();
        self.send(Job::Initialize { reply })?;

        rx.recv().map_err(|_| ArmCtrlError::ServiceStopped)?
    }

    /// Queue a command. Its result is delivered on the returned receiver.
    ///
    /// [`ArmCmd::Stop`] is not queued, the stop is applied before this
    /// returns.
    pub fn submit(&self, cmd: ArmCmd) -> Receiver<CmdResult> {
        let (reply, rx) = channel();

        if cmd == ArmCmd::Stop {
            // Ignoring the send error as rx is in scope
            reply
                .send(self.emergency_stop().map(|_| CmdOutput::Done))
                .ok();
        } else if let Err(e) = self.enqueue(cmd, Some(reply.clone())) {
            reply.send(Err(e)).ok();
        }

        rx
    }

    /// Queue a command and wait for its result.
    pub fn execute(&self, cmd: ArmCmd) -> CmdResult {
        self.submit(cmd)
            .recv()
            .map_err(|_| ArmCtrlError::ServiceStopped)?
    }

    /// Stop the arm immediately.
    ///
    /// `STOP` is sent from the calling thread. The command in progress is
    /// aborted and those queued before this call are dropped unexecuted.
    pub fn emergency_stop(&self) -> Result<(), ArmCtrlError> {
        let outcome = self.stop.trigger();

        let (reply, rx) = channel();
        if let Err(e) = self.send(Job::StopApplied { outcome, reply }) {
            error!("Emergency stop sent but the arm worker is gone");
            return Err(e);
        }

        match rx.recv_timeout(self.stop_timeout) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Arm worker did not apply the emergency stop within {:?}",
                    self.stop_timeout
                );
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => Err(ArmCtrlError::ServiceStopped),
        }
    }

    /// Latest arm state.
    pub fn status(&self) -> RobotState {
        match self.status_board.read() {
            Ok(s) => s.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    /// Act on an event received from the bus.
    pub fn handle_event(&self, envelope: &Envelope) {
        match &envelope.event {
            ArmEvent::RobotCommand { cmd } => {
                debug!("Command {} from {}", cmd.name(), envelope.source);

                let result = match cmd {
                    ArmCmd::Stop => self.emergency_stop(),
                    _ => self.enqueue(cmd.clone(), None),
                };
                if let Err(e) = result {
                    error!("Could not handle {} from {}: {}", cmd.name(), envelope.source, e);
                }
            }
            ArmEvent::EmergencyStop => {
                info!("Emergency stop requested by {}", envelope.source);
                if let Err(e) = self.emergency_stop() {
                    error!("{}", e);
                }
            }
            _ => (),
        }
    }

    /// Stop the worker once the queued commands are done and disconnect the
    /// arm.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn enqueue(&self, cmd: ArmCmd, reply: Option<Sender<CmdResult>>) -> Result<(), ArmCtrlError> {
        let epoch = self.stop.epoch();
        self.send(Job::Command { cmd, epoch, reply })
    }

    fn send(&self, job: Job) -> Result<(), ArmCtrlError> {
        self.worker_sender
            .send(job)
            .map_err(|_| ArmCtrlError::ServiceStopped)
    }

    fn stop_worker(&mut self) {
        if let Some(jh) = self.worker_jh.take() {
            self.worker_sender.send(Job::Shutdown).ok();

            if jh.join().is_err() {
                error!("Arm worker thread panicked");
            }
        }
    }
}

impl Drop for ArmService {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

fn worker_thread(mut ctrl: ArmCtrl, rx: Receiver<Job>, publisher: Option<Box<dyn Publisher>>) {
    debug!("Arm worker started");

    let publish = |event: ArmEvent| {
        if let Some(ref p) = publisher {
            if let Err(e) = p.publish(event) {
                debug!("Could not publish arm event: {}", e);
            }
        }
    };

    while let Ok(job) = rx.recv() {
        match job {
            Job::Initialize { reply } => {
                let result = ctrl.initialize();
                publish(status_event(&ctrl));
                reply.send(result).ok();
            }
            Job::Command { cmd, epoch, reply } => {
                let result = if epoch != ctrl.stop_epoch() {
                    debug!("Dropping {} queued before an emergency stop", cmd.name());
                    Err(ArmCtrlError::Link(LinkError::Aborted))
                } else {
                    run_command(&mut ctrl, &cmd)
                };

                publish(ArmEvent::CommandResult {
                    cmd,
                    success: result.is_ok(),
                    error: result.as_ref().err().map(|e| e.to_string()),
                });
                publish(status_event(&ctrl));

                if let Some(reply) = reply {
                    reply.send(result).ok();
                }
            }
            Job::StopApplied { outcome, reply } => {
                let result = ctrl.apply_stop(outcome);

                publish(ArmEvent::CommandResult {
                    cmd: ArmCmd::Stop,
                    success: result.is_ok(),
                    error: result.as_ref().err().map(|e| e.to_string()),
                });
                publish(status_event(&ctrl));

                reply.send(result).ok();
            }
            Job::Shutdown => break,
        }
    }

    ctrl.disconnect();
    debug!("Arm worker stopped");
}

fn run_command(ctrl: &mut ArmCtrl, cmd: &ArmCmd) -> CmdResult {
    info!("Executing {}", cmd.name());

    match cmd {
        ArmCmd::Home => ctrl.home(),
        ArmCmd::ExecuteMove { from, to } => ctrl.execute_move(from, to),
        ArmCmd::Pick { square } => ctrl.pick(square),
        ArmCmd::Place { square } => ctrl.place(square),
        ArmCmd::MoveToSquare { square, height_mm } => ctrl.move_to_square(square, *height_mm),
        ArmCmd::MoveToPose {
            x_mm,
            y_mm,
            z_mm,
            rx_rad,
            ry_rad,
            rz_rad,
        } => ctrl.move_to_pose(&Pose6D::new(*x_mm, *y_mm, *z_mm, *rx_rad, *ry_rad, *rz_rad)),
        ArmCmd::Gripper { close } => ctrl.gripper_control(*close),
        ArmCmd::ReadJoints => return ctrl.read_joint_positions().map(CmdOutput::Joints),
        ArmCmd::Stop => ctrl.emergency_stop(),
    }
    .map(|_| CmdOutput::Done)
}

fn status_event(ctrl: &ArmCtrl) -> ArmEvent {
    ArmEvent::StatusUpdate {
        status: ctrl.status().to_status(),
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::arm_ctrl::{ArmMode, Params};
    use crate::dev_link::{DeviceLink, LinkParams, SimHandle, SimTransport};
    use comms_if::net::{local_bus, Subscriber, Topic};
    use std::time::Instant;

    fn test_params(waypoint_settle_s: f64) -> Params {
        Params {
            waypoint_settle_s,
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

    fn service(
        waypoint_settle_s: f64,
        publisher: Option<Box<dyn Publisher>>,
    ) -> (ArmService, SimHandle) {
        let params = test_params(waypoint_settle_s);
        let (transport, sim) = SimTransport::new();
        let link = DeviceLink::new(params.link.clone(), Box::new(transport));
        let ctrl = ArmCtrl::new(params, link).unwrap();

        let service = ArmService::spawn(ctrl, publisher).unwrap();
        service.initialize().unwrap();

        (service, sim)
    }

    #[test]
    fn test_execute() {
        let (service, sim) = service(0.0, None);

        assert!(matches!(
            service.execute(ArmCmd::MoveToSquare {
                square: "a1".into(),
                height_mm: 50.0
            }),
            Ok(CmdOutput::Done)
        ));
        assert_eq!(service.status().mode, ArmMode::Idle);

        match service.execute(ArmCmd::ReadJoints) {
            Ok(CmdOutput::Joints(joints)) => {
                // Frames carry whole microsecond pulse widths
                let expected = service.status().current_joints;
                for j in 0..joints.len() {
                    assert!((joints[j] - expected[j]).abs() < 0.2f64.to_radians());
                }
            }
            other => panic!("unexpected result {:?}", other),
        }

        let err = service
            .execute(ArmCmd::Pick {
                square: "i9".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ArmCtrlError::InvalidSquare(_)));

        service.shutdown();
        assert_eq!(sim.count_matching("STOP"), 0);
    }

    #[test]
    fn test_stop_flushes_queue() {
        // 20 steps of 20 ms per trajectory, so the move takes seconds
        let (service, sim) = service(0.02, None);

        let first = service.submit(ArmCmd::ExecuteMove {
            from: "e2".into(),
            to: "e4".into(),
        });
        let second = service.submit(ArmCmd::Home);

        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        service.emergency_stop().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));

        let frames = sim.count_matching("#");
        assert!(first.recv().unwrap().unwrap_err().is_abort());
        assert!(second.recv().unwrap().unwrap_err().is_abort());

        // Nothing queued before the stop reached the arm
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sim.count_matching("#"), frames);

        let status = service.status();
        assert_eq!(status.mode, ArmMode::Idle);
        assert!(!status.moving);

        // Commands submitted after the stop run normally
        assert!(matches!(
            service.execute(ArmCmd::Gripper { close: false }),
            Ok(CmdOutput::Done)
        ));
    }

    #[test]
    fn test_stop_command() {
        let (service, sim) = service(0.0, None);

        assert!(matches!(service.execute(ArmCmd::Stop), Ok(CmdOutput::Done)));
        assert!(matches!(service.execute(ArmCmd::Stop), Ok(CmdOutput::Done)));
        assert_eq!(sim.count_matching("STOP"), 2);
        assert_eq!(service.status().mode, ArmMode::Idle);
    }

    #[test]
    fn test_events() {
        let (publisher, subscriber) = local_bus("robot_service");
        let (service, _sim) = service(0.0, Some(Box::new(publisher)));

        // Initialisation status
        let init = subscriber
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(init.topic, Topic::RobotStatus);

        service.handle_event(&Envelope::new(
            "game_service",
            ArmEvent::RobotCommand {
                cmd: ArmCmd::Gripper { close: true },
            },
        ));

        let result = subscriber
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(
            result.event,
            ArmEvent::CommandResult {
                cmd: ArmCmd::Gripper { close: true },
                success: true,
                error: None
            }
        );

        match subscriber
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap()
            .event
        {
            ArmEvent::StatusUpdate { status } => {
                assert!(status.gripper_closed);
                assert_eq!(status.mode, "Idle");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
