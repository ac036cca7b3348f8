//! Testing utilities and mock implementations
//!
//! Mocks for exercising the bus, persistence and history without a broker or
//! a database.

pub mod mocks;

pub use mocks::*;
