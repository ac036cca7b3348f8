//! Bus message types and topic handling
//!
//! This module implements the event envelope exchanged between agents and
//! the topic naming rules shared by every transport.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
