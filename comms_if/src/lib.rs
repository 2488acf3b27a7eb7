//! # Communications interface crate.
//!
//! Provides the interfaces shared between the arm executable and its
//! collaborators: telecommands, the arm firmware's serial protocol, vision
//! payloads and the event bus.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod tc;

/// Command and response definitions for equipment (the arm firmware and the
/// vision system)
pub mod eqpt;

/// Event publishing and subscription
pub mod net;
