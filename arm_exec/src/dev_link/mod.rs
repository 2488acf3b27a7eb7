//! # Device link
//!
//! Line-oriented link to the arm firmware. Every command is acknowledged by a
//! single reply line, and a command only succeeds when that reply is exactly
//! `OK` within the acknowledgement timeout.
//!
//! The link can be preempted. A [`StopHandle`] held by another thread bumps
//! the link's stop epoch and sends `STOP` while holding the transport. Any
//! acknowledgement wait or settle delay started under an older epoch returns
//! [`LinkError::Aborted`] within one poll period.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod sim;
mod transport;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::eqpt::arm::{self, ControlCmd};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use util::logger::WIRE_TARGET;
use util::time::seconds_to_std;

pub use sim::*;
pub use transport::*;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Shortest slice an acknowledgement wait or settle delay is split into.
const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters of the serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Serial port device
    pub port: String,

    pub baud_rate: u32,

    /// Time allowed for the firmware to reply to a command.
    ///
    /// Units: seconds
    pub ack_timeout_s: f64,

    /// Period at which acknowledgement waits and settle delays check for an
    /// emergency stop.
    ///
    /// Units: seconds
    pub ack_poll_s: f64,

    /// Time the firmware needs after the port is opened before it accepts
    /// commands.
    ///
    /// Units: seconds
    pub open_settle_s: f64,
}

/// Link to the arm firmware.
pub struct DeviceLink {
    shared: Arc<LinkShared>,
}

/// Handle able to stop the arm from any thread.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<LinkShared>,
}

/// State shared between the link and its stop handles.
struct LinkShared {
    params: LinkParams,
    transport: Mutex<Box<dyn Transport>>,
    stop_epoch: AtomicU64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors raised by the device link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("The serial link is not open")]
    NotOpen,

    #[error("Could not open the serial link: {0}")]
    OpenFailed(io::Error),

    #[error("Handshake with the arm firmware failed: {0}")]
    HandshakeFailed(Box<LinkError>),

    #[error("Could not write to the serial link: {0}")]
    WriteFailed(io::Error),

    #[error("Could not read from the serial link: {0}")]
    ReadFailed(io::Error),

    #[error("No reply to {cmd:?} within {timeout_s} s")]
    AckTimeout { cmd: String, timeout_s: f64 },

    #[error("Command {cmd:?} was not acknowledged (reply {reply:?})")]
    Rejected { cmd: String, reply: String },

    #[error("Command aborted by an emergency stop")]
    Aborted,

    #[error("The link's transport mutex is poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            ack_timeout_s: 2.0,
            ack_poll_s: 0.01,
            open_settle_s: 2.0,
        }
    }
}

impl LinkParams {
    pub fn ack_timeout(&self) -> Duration {
        seconds_to_std(self.ack_timeout_s)
    }

    pub fn poll_period(&self) -> Duration {
        seconds_to_std(self.ack_poll_s).max(MIN_POLL_PERIOD)
    }
}

impl DeviceLink {
    /// Create a link over the given transport. The transport is not opened
    /// until [`DeviceLink::open`] is called.
    pub fn new(params: LinkParams, transport: Box<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                params,
                transport: Mutex::new(transport),
                stop_epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn params(&self) -> &LinkParams {
        &self.shared.params
    }

    /// Open the transport, wait for the firmware to settle and perform the
    /// `INIT` handshake.
    ///
    /// The transport is closed again if the handshake fails.
    pub fn open(&self) -> Result<(), LinkError> {
        let params = &self.shared.params;

        {
            let mut transport = self.shared.lock()?;
            if !transport.is_open() {
                transport.open(params).map_err(LinkError::OpenFailed)?;
            }
        }

        info!(
            "Serial link open on {} at {} baud, waiting {} s for the firmware",
            params.port, params.baud_rate, params.open_settle_s
        );
        thread::sleep(seconds_to_std(params.open_settle_s));

        match self.send_command(&ControlCmd::Init.to_line(), self.epoch()) {
            Ok(()) => {
                info!("Arm firmware handshake complete");
                Ok(())
            }
            Err(e) => {
                warn!("Arm firmware handshake failed: {}", e);
                self.close();
                Err(LinkError::HandshakeFailed(Box::new(e)))
            }
        }
    }

    /// Close the transport.
    pub fn close(&self) {
        match self.shared.lock() {
            Ok(mut t) => t.close(),
            Err(e) => warn!("Could not close the serial link: {}", e),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().map(|t| t.is_open()).unwrap_or(false)
    }

    /// Current stop epoch. Operations capture it when they start and are
    /// aborted once it changes.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Send a command and wait for its acknowledgement.
    pub fn send_command(&self, line: &str, epoch: u64) -> Result<(), LinkError> {
        let reply = self.shared.transact(line, Some(epoch))?;

        check_ack(line, reply)
    }

    /// Send a command and return its reply line, whatever it is.
    pub fn query(&self, line: &str, epoch: u64) -> Result<String, LinkError> {
        self.shared.transact(line, Some(epoch))
    }

    /// Wait for the given duration, returning early with `Aborted` if the
    /// arm is stopped meanwhile.
    pub fn settle(&self, duration: Duration, epoch: u64) -> Result<(), LinkError> {
        let poll = self.shared.params.poll_period();
        let start = Instant::now();

        loop {
            self.shared.check_epoch(Some(epoch))?;

            let elapsed = start.elapsed();
            if elapsed >= duration {
                return Ok(());
            }

            thread::sleep(poll.min(duration - elapsed));
        }
    }
}

impl StopHandle {
    /// Stop the arm.
    ///
    /// The stop epoch is bumped first so that the operation in progress
    /// gives up the transport, then `STOP` is sent and acknowledged while the
    /// transport is held.
    pub fn trigger(&self) -> Result<(), LinkError> {
        let epoch = self.shared.stop_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        error!("Emergency stop triggered (stop epoch {})", epoch);

        let line = ControlCmd::Stop.to_line();
        let reply = self.shared.transact_exclusive(&line)?;

        check_ack(&line, reply)
    }

    /// Current stop epoch.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch()
    }
}

impl LinkShared {
    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn Transport>>, LinkError> {
        self.transport.lock().map_err(|_| LinkError::Poisoned)
    }

    fn epoch(&self) -> u64 {
        self.stop_epoch.load(Ordering::SeqCst)
    }

    fn check_epoch(&self, epoch: Option<u64>) -> Result<(), LinkError> {
        match epoch {
            Some(e) if e != self.epoch() => Err(LinkError::Aborted),
            _ => Ok(()),
        }
    }

    fn write(&self, transport: &mut Box<dyn Transport>, line: &str) -> Result<(), LinkError> {
        if !transport.is_open() {
            return Err(LinkError::NotOpen);
        }

        // Drop anything left over from an earlier timed out command
        transport.clear_input().map_err(LinkError::ReadFailed)?;
        transport.write_line(line).map_err(LinkError::WriteFailed)?;
        trace!(target: WIRE_TARGET, "-> {}", line);

        Ok(())
    }

    /// Write a line and wait for the reply, releasing the transport between
    /// poll slices so a stop can get through.
    fn transact(&self, line: &str, epoch: Option<u64>) -> Result<String, LinkError> {
        {
            let mut transport = self.lock()?;
            self.check_epoch(epoch)?;
            self.write(&mut transport, line)?;
        }

        let timeout = self.params.ack_timeout();
        let poll = self.params.poll_period();
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                debug!("No reply to {:?} within {:?}", line, timeout);
                return Err(LinkError::AckTimeout {
                    cmd: line.to_string(),
                    timeout_s: self.params.ack_timeout_s,
                });
            }

            // Checked before locking as well so a pending stop is not
            // starved of the transport
            self.check_epoch(epoch)?;
            let mut transport = self.lock()?;
            self.check_epoch(epoch)?;

            if let Some(reply) = transport
                .read_line(poll.min(timeout - elapsed))
                .map_err(LinkError::ReadFailed)?
            {
                trace!(target: WIRE_TARGET, "<- {}", reply);
                return Ok(reply);
            }
        }
    }

    /// Write a line and wait for the reply holding the transport throughout.
    ///
    /// Replies still on their way to an aborted command are drained for one
    /// poll period first, so they are not taken for the reply to `line`.
    fn transact_exclusive(&self, line: &str) -> Result<String, LinkError> {
        let mut transport = self.lock()?;
        self.drain(&mut transport)?;
        self.write(&mut transport, line)?;

        let timeout = self.params.ack_timeout();
        let poll = self.params.poll_period();
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(LinkError::AckTimeout {
                    cmd: line.to_string(),
                    timeout_s: self.params.ack_timeout_s,
                });
            }

            if let Some(reply) = transport
                .read_line(poll.min(timeout - elapsed))
                .map_err(LinkError::ReadFailed)?
            {
                trace!(target: WIRE_TARGET, "<- {}", reply);
                return Ok(reply);
            }
        }
    }

    /// Read and discard input until a poll period has passed or the line
    /// goes quiet.
    fn drain(&self, transport: &mut Box<dyn Transport>) -> Result<(), LinkError> {
        if !transport.is_open() {
            return Err(LinkError::NotOpen);
        }

        let deadline = Instant::now() + self.params.poll_period();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }

            match transport
                .read_line(remaining)
                .map_err(LinkError::ReadFailed)?
            {
                Some(stale) => {
                    trace!(target: WIRE_TARGET, "<- {} (discarded)", stale);
                    debug!("Discarded late reply {:?}", stale);
                }
                None => return Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

fn check_ack(line: &str, reply: String) -> Result<(), LinkError> {
    if arm::is_ack(&reply) {
        Ok(())
    } else {
        Err(LinkError::Rejected {
            cmd: line.to_string(),
            reply,
        })
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn test_params() -> LinkParams {
        LinkParams {
            ack_timeout_s: 0.2,
            ack_poll_s: 0.005,
            open_settle_s: 0.0,
            ..Default::default()
        }
    }

    fn open_link() -> (DeviceLink, SimHandle) {
        let (transport, sim) = SimTransport::new();
        let link = DeviceLink::new(test_params(), Box::new(transport));
        link.open().unwrap();

        (link, sim)
    }

    #[test]
    fn test_open_handshake() {
        let (link, sim) = open_link();

        assert!(link.is_open());
        assert_eq!(sim.received(), vec!["INIT".to_string()]);
    }

    #[test]
    fn test_open_failures() {
        let (transport, sim) = SimTransport::new();
        sim.set_fail_open(true);
        let link = DeviceLink::new(test_params(), Box::new(transport));
        assert!(matches!(link.open(), Err(LinkError::OpenFailed(_))));

        // A rejected handshake closes the port again
        let (transport, sim) = SimTransport::new();
        sim.inject("INIT", SimReply::Reply("ERR".into()), None);
        let link = DeviceLink::new(test_params(), Box::new(transport));
        assert!(matches!(link.open(), Err(LinkError::HandshakeFailed(_))));
        assert!(!link.is_open());
    }

    #[test]
    fn test_not_open() {
        let (transport, _sim) = SimTransport::new();
        let link = DeviceLink::new(test_params(), Box::new(transport));

        assert!(matches!(
            link.send_command("GRIP_OPEN", link.epoch()),
            Err(LinkError::NotOpen)
        ));
    }

    #[test]
    fn test_ack_required() {
        let (link, sim) = open_link();
        let epoch = link.epoch();

        assert!(link.send_command("GRIP_CLOSE", epoch).is_ok());

        sim.inject("GRIP_OPEN", SimReply::Reply("BUSY".into()), Some(1));
        assert!(matches!(
            link.send_command("GRIP_OPEN", epoch),
            Err(LinkError::Rejected { .. })
        ));

        sim.inject("GRIP_OPEN", SimReply::Silent, Some(1));
        let start = Instant::now();
        assert!(matches!(
            link.send_command("GRIP_OPEN", epoch),
            Err(LinkError::AckTimeout { .. })
        ));
        assert!(start.elapsed() >= Duration::from_millis(200));

        // Faults are used up
        assert!(link.send_command("GRIP_OPEN", epoch).is_ok());
    }

    #[test]
    fn test_query() {
        let (link, _sim) = open_link();

        let reply = link.query("GET_JOINT_POS", link.epoch()).unwrap();
        assert_eq!(
            arm::parse_joint_positions(&reply).unwrap(),
            [0.0; arm::NUM_JOINTS]
        );
    }

    #[test]
    fn test_stop_preempts_wait() {
        let (link, sim) = open_link();
        let stop = link.stop_handle();

        // The firmware never answers this frame, only the stop gets it free
        sim.inject("#", SimReply::Silent, Some(1));

        let epoch = link.epoch();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            stop.trigger()
        });

        let start = Instant::now();
        let frame = arm::encode_joint_frame(&[10.0; arm::NUM_JOINTS], 1000);
        assert!(matches!(
            link.send_command(&frame, epoch),
            Err(LinkError::Aborted)
        ));
        assert!(start.elapsed() < Duration::from_millis(150));

        assert!(stopper.join().unwrap().is_ok());
        assert_eq!(link.epoch(), epoch + 1);
        assert_eq!(sim.count_matching("STOP"), 1);

        // Stale epochs are refused, fresh ones work
        assert!(matches!(
            link.send_command("GRIP_OPEN", epoch),
            Err(LinkError::Aborted)
        ));
        assert!(link.send_command("GRIP_OPEN", link.epoch()).is_ok());
    }

    #[test]
    fn test_settle_aborts() {
        let (link, _sim) = open_link();
        let epoch = link.epoch();

        assert!(link.settle(Duration::from_millis(10), epoch).is_ok());

        link.stop_handle().trigger().unwrap();
        assert!(matches!(
            link.settle(Duration::from_secs(5), epoch),
            Err(LinkError::Aborted)
        ));
    }

    #[test]
    fn test_stop_ignores_late_reply() {
        let (transport, sim) = SimTransport::new();
        let params = LinkParams {
            ack_timeout_s: 0.05,
            ack_poll_s: 0.1,
            ..test_params()
        };
        let link = DeviceLink::new(params, Box::new(transport));
        link.open().unwrap();

        // The gripper command times out and its refusal only comes in once
        // the stop is under way
        sim.inject(
            "GRIP_OPEN",
            SimReply::Delayed("ERR BUSY".into(), Duration::from_millis(100)),
            Some(1),
        );
        assert!(matches!(
            link.send_command("GRIP_OPEN", link.epoch()),
            Err(LinkError::AckTimeout { .. })
        ));

        assert!(link.stop_handle().trigger().is_ok());
        assert_eq!(sim.count_matching("STOP"), 1);
    }

    #[test]
    fn test_unacknowledged_stop() {
        let (link, sim) = open_link();
        sim.inject("STOP", SimReply::Silent, None);

        assert!(matches!(
            link.stop_handle().trigger(),
            Err(LinkError::AckTimeout { .. })
        ));
    }
}
