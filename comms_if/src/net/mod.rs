//! # Network Module
//!
//! Fire-and-forget publish/subscribe of arm events. Publishers never block on
//! subscribers and delivery is at most once. The in-process bus provided here
//! connects the arm service to the executable's event log; other transports
//! carry the same [`Envelope`] serialised as JSON.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;
use thiserror::Error;

use crate::eqpt::arm::ArmStatus;
use crate::tc::arm_ctrl::ArmCmd;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Something events can be published to.
pub trait Publisher: Send {
    /// Publish an event. Failing to deliver is reported but never retried.
    fn publish(&self, event: ArmEvent) -> Result<(), NetError>;
}

/// Something events can be received from.
pub trait Subscriber: Send {
    /// Wait up to `timeout` for the next event.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, NetError>;

    /// Get the next event if one is already waiting.
    fn try_recv(&self) -> Result<Option<Envelope>, NetError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An event along with its routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub event: ArmEvent,
}

/// Publishing half of the in-process bus.
#[derive(Clone)]
pub struct LocalPublisher {
    source: String,
    tx: Sender<Envelope>,
}

/// Subscribing half of the in-process bus.
pub struct LocalSubscriber {
    rx: Receiver<Envelope>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Topics events are published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    RobotCommand,
    EmergencyStop,
    CommandResult,
    RobotStatus,
    CalibrationCompleted,
}

/// Which calibration completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibKind {
    DhParameters,
    HandEye,
    Home,
}

/// Events exchanged between the arm service and other services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ArmEvent {
    /// A command for the arm to execute.
    RobotCommand { cmd: ArmCmd },

    /// Request to stop the arm immediately.
    EmergencyStop,

    /// Outcome of a command.
    CommandResult {
        cmd: ArmCmd,
        success: bool,
        error: Option<String>,
    },

    /// Snapshot of the arm state.
    StatusUpdate { status: ArmStatus },

    /// A calibration step finished successfully.
    CalibrationCompleted {
        kind: CalibKind,
        mean_error_mm: Option<f64>,
    },
}

/// Errors raised by the network layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("The other end of the bus has been dropped")]
    Disconnected,

    #[error("Could not (de)serialise an envelope: {0}")]
    SerializationError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// ------------------------------------------------------------------------------------------------

impl ArmEvent {
    /// The topic this event is published on.
    pub fn topic(&self) -> Topic {
        match self {
            ArmEvent::RobotCommand { .. } => Topic::RobotCommand,
            ArmEvent::EmergencyStop => Topic::EmergencyStop,
            ArmEvent::CommandResult { .. } => Topic::CommandResult,
            ArmEvent::StatusUpdate { .. } => Topic::RobotStatus,
            ArmEvent::CalibrationCompleted { .. } => Topic::CalibrationCompleted,
        }
    }
}

impl Envelope {
    /// Wrap an event, stamping it with the current time.
    pub fn new(source: &str, event: ArmEvent) -> Self {
        Self {
            topic: event.topic(),
            source: source.to_string(),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, NetError> {
        serde_json::to_string(self).map_err(NetError::SerializationError)
    }

    pub fn from_json(json_str: &str) -> Result<Self, NetError> {
        serde_json::from_str(json_str).map_err(NetError::SerializationError)
    }
}

impl Publisher for LocalPublisher {
    fn publish(&self, event: ArmEvent) -> Result<(), NetError> {
        self.tx
            .send(Envelope::new(&self.source, event))
            .map_err(|_| NetError::Disconnected)
    }
}

impl Subscriber for LocalSubscriber {
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, NetError> {
        match self.rx.recv_timeout(timeout) {
            Ok(e) => Ok(Some(e)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(NetError::Disconnected),
        }
    }

    fn try_recv(&self) -> Result<Option<Envelope>, NetError> {
        match self.rx.try_recv() {
            Ok(e) => Ok(Some(e)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(NetError::Disconnected),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Create an in-process bus. The publisher can be cloned to give several
/// producers feeding the one subscriber.
pub fn local_bus(source: &str) -> (LocalPublisher, LocalSubscriber) {
    let (tx, rx) = channel();

    (
        LocalPublisher {
            source: source.to_string(),
            tx,
        },
        LocalSubscriber { rx },
    )
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
