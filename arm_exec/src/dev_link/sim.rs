//! Simulated arm firmware
//!
//! Speaks the same protocol as the real firmware: joint frames and
//! `MOVE_JOINT` update the simulated joint positions, `GET_JOINT_POS` reports
//! them and every other line is acknowledged. Faults can be injected per
//! command prefix through a [`SimHandle`].
//!
//! Like the real firmware, commands are answered in the order they were
//! received, so a delayed reply holds back the replies behind it.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::eqpt::arm::{self, ACK, NUM_JOINTS};
use log::debug;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::{LinkParams, Transport};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Most received lines kept for inspection, older ones are dropped.
pub const SIM_HISTORY_LEN: usize = 10_000;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Transport backed by the simulated firmware.
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
}

/// Handle used to inspect and script the simulated firmware.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

#[derive(Default)]
struct SimState {
    open: bool,
    fail_open: bool,

    /// Lines written by the host since the port was opened, at most
    /// [`SIM_HISTORY_LEN`] of them
    received: VecDeque<String>,

    /// Replies in the order they are sent, with the time they reach the host
    replies: VecDeque<(Instant, String)>,

    joints_deg: [f64; NUM_JOINTS],

    faults: Vec<SimFault>,
}

struct SimFault {
    prefix: String,
    reply: SimReply,
    remaining: Option<usize>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Reply given to a command matched by an injected fault.
#[derive(Debug, Clone, PartialEq)]
pub enum SimReply {
    /// Reply with the given line, and do not act on the command.
    Reply(String),

    /// Never reply, and do not act on the command.
    Silent,

    /// Reply with the given line once the delay has passed, and do not act
    /// on the command.
    Delayed(String, Duration),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SimTransport {
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));

        (
            Self {
                state: state.clone(),
            },
            SimHandle { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }
}

impl SimHandle {
    /// Lines received since the port was last opened, oldest first.
    pub fn received(&self) -> Vec<String> {
        lock(&self.state).received.iter().cloned().collect()
    }

    /// Number of received lines starting with `prefix`.
    pub fn count_matching(&self, prefix: &str) -> usize {
        lock(&self.state)
            .received
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }

    /// Answer commands starting with `prefix` with `reply`, `times` times or
    /// forever. Earlier faults take precedence over later ones.
    pub fn inject(&self, prefix: &str, reply: SimReply, times: Option<usize>) {
        lock(&self.state).faults.push(SimFault {
            prefix: prefix.to_string(),
            reply,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults.clear();
    }

    /// Make the next opens fail.
    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    /// Joint positions last commanded to the simulated servos.
    pub fn joints_deg(&self) -> [f64; NUM_JOINTS] {
        lock(&self.state).joints_deg
    }
}

impl SimState {
    /// Queue a reply reaching the host after `delay`, and never before the
    /// replies already queued.
    fn send_reply(&mut self, reply: String, delay: Duration) {
        let mut arrival = Instant::now() + delay;
        if let Some((last, _)) = self.replies.back() {
            arrival = arrival.max(*last);
        }

        self.replies.push_back((arrival, reply));
    }

    /// Arrival time of the next reply.
    fn next_arrival(&self) -> Option<Instant> {
        self.replies.front().map(|(t, _)| *t)
    }

    /// Take the next reply if it has reached the host.
    fn take_arrived(&mut self) -> Option<String> {
        match self.next_arrival() {
            Some(t) if t <= Instant::now() => self.replies.pop_front().map(|(_, r)| r),
            _ => None,
        }
    }

    /// Take the reply of the first fault matching the line, if any.
    fn take_fault(&mut self, line: &str) -> Option<SimReply> {
        let fault = self.faults.iter_mut().find(|f| {
            line.starts_with(f.prefix.as_str()) && f.remaining.map_or(true, |n| n > 0)
        })?;

        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }

        Some(fault.reply.clone())
    }

    /// Act on a command and produce the firmware's reply.
    fn execute(&mut self, line: &str) -> String {
        if arm::is_joint_frame(line) {
            return match arm::decode_joint_frame(line) {
                Ok(entries) => {
                    for e in entries.iter() {
                        if let Some(j) = self.joints_deg.get_mut(e.id as usize) {
                            *j = arm::angle_from_pulse_width(e.pulse_width_us);
                        }
                    }
                    ACK.into()
                }
                Err(_) => "ERR FRAME".into(),
            };
        }

        if let Some(args) = line.strip_prefix("MOVE_JOINT ") {
            // Joint angles followed by the speed
            let values: Vec<&str> = args.rsplitn(2, ',').collect();
            return match values.get(1).map(|j| arm::parse_joint_positions(j)) {
                Some(Ok(joints)) => {
                    self.joints_deg = joints;
                    ACK.into()
                }
                _ => "ERR ARGS".into(),
            };
        }

        match line {
            "GET_JOINT_POS" => arm::format_joint_positions(&self.joints_deg),
            "SET_HOME" => {
                self.joints_deg = [0.0; NUM_JOINTS];
                ACK.into()
            }
            _ => ACK.into(),
        }
    }
}

impl Transport for SimTransport {
    fn open(&mut self, _params: &LinkParams) -> io::Result<()> {
        let mut state = self.state();

        if state.fail_open {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "simulated port unavailable",
            ));
        }

        debug!("Simulated arm firmware connected");
        state.open = true;
        state.received.clear();
        state.replies.clear();

        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = self.state();

        if !state.open {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "simulated port not open",
            ));
        }

        if state.received.len() >= SIM_HISTORY_LEN {
            state.received.pop_front();
        }
        state.received.push_back(line.to_string());

        match state.take_fault(line) {
            Some(SimReply::Reply(r)) => state.send_reply(r, Duration::ZERO),
            Some(SimReply::Silent) => (),
            Some(SimReply::Delayed(r, delay)) => state.send_reply(r, delay),
            None => {
                let r = state.execute(line);
                state.send_reply(r, Duration::ZERO);
            }
        }

        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;

        // Wait for the next reply if it arrives in time, or out the whole
        // timeout like a real port would
        let wake = match self.state().next_arrival() {
            Some(t) if t <= deadline => t,
            _ => deadline,
        };
        thread::sleep(wake.saturating_duration_since(Instant::now()));

        Ok(self.state().take_arrived())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let now = Instant::now();
        self.state().replies.retain(|(t, _)| *t > now);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Lock the simulated state, recovering it if a test thread panicked while
/// holding it.
fn lock(state: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn open_sim() -> (SimTransport, SimHandle) {
        let (mut t, h) = SimTransport::new();
        t.open(&LinkParams::default()).unwrap();

        (t, h)
    }

    fn exchange(t: &mut SimTransport, line: &str) -> Option<String> {
        t.write_line(line).unwrap();
        t.read_line(Duration::from_millis(1)).unwrap()
    }

    #[test]
    fn test_tracks_joints() {
        let (mut t, h) = open_sim();

        let frame = arm::encode_joint_frame(&[0.0, 45.0, -90.0, 0.0, 9.0, 0.0], 100);
        assert_eq!(exchange(&mut t, &frame), Some("OK".into()));
        assert_eq!(h.joints_deg(), [0.0, 45.0, -90.0, 0.0, 9.0, 0.0]);

        assert_eq!(
            exchange(&mut t, "GET_JOINT_POS"),
            Some("0.00,45.00,-90.00,0.00,9.00,0.00".into())
        );

        assert_eq!(
            exchange(&mut t, "MOVE_JOINT 1.00,2.00,3.00,4.00,5.00,6.00,50"),
            Some("OK".into())
        );
        assert_eq!(h.joints_deg(), [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        assert_eq!(exchange(&mut t, "SET_HOME"), Some("OK".into()));
        assert_eq!(h.joints_deg(), [0.0; NUM_JOINTS]);
    }

    #[test]
    fn test_faults() {
        let (mut t, h) = open_sim();

        h.inject("GRIP", SimReply::Reply("ERR".into()), Some(1));
        h.inject("GRIP_OPEN", SimReply::Silent, None);

        assert_eq!(exchange(&mut t, "GRIP_CLOSE"), Some("ERR".into()));
        assert_eq!(exchange(&mut t, "GRIP_CLOSE"), Some("OK".into()));
        assert_eq!(exchange(&mut t, "GRIP_OPEN"), None);
        assert_eq!(h.count_matching("GRIP"), 3);

        h.clear_faults();
        assert_eq!(exchange(&mut t, "GRIP_OPEN"), Some("OK".into()));
    }

    #[test]
    fn test_delayed_reply_holds_back_later_ones() {
        let (mut t, h) = open_sim();
        h.inject(
            "GRIP_OPEN",
            SimReply::Delayed("ERR BUSY".into(), Duration::from_millis(40)),
            Some(1),
        );

        assert_eq!(exchange(&mut t, "GRIP_OPEN"), None);

        // Not there yet, so clearing the input keeps it
        t.clear_input().unwrap();
        t.write_line("STOP").unwrap();
        assert_eq!(t.read_line(Duration::from_millis(1)).unwrap(), None);

        assert_eq!(
            t.read_line(Duration::from_millis(200)).unwrap(),
            Some("ERR BUSY".into())
        );
        assert_eq!(
            t.read_line(Duration::from_millis(1)).unwrap(),
            Some("OK".into())
        );

        // Replies already in are dropped by a clear
        t.write_line("GRIP_CLOSE").unwrap();
        t.clear_input().unwrap();
        assert_eq!(t.read_line(Duration::from_millis(1)).unwrap(), None);
    }

    #[test]
    fn test_history() {
        let (mut t, h) = open_sim();

        for _ in 0..SIM_HISTORY_LEN + 5 {
            t.write_line("GRIP_OPEN").unwrap();
            t.read_line(Duration::ZERO).unwrap();
        }
        t.write_line("GRIP_CLOSE").unwrap();

        let received = h.received();
        assert_eq!(received.len(), SIM_HISTORY_LEN);
        assert_eq!(received.last(), Some(&"GRIP_CLOSE".to_string()));

        // A new connection starts from a clean slate
        t.close();
        t.open(&LinkParams::default()).unwrap();
        assert!(h.received().is_empty());
        assert_eq!(t.read_line(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn test_closed() {
        let (mut t, h) = SimTransport::new();
        assert!(t.write_line("INIT").is_err());

        h.set_fail_open(true);
        assert!(t.open(&LinkParams::default()).is_err());
        assert!(!t.is_open());
    }
}
