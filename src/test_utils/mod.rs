//! Shared helpers for unit tests: a recording event bus, recording
//! callbacks and small async utilities.
mod bus;
mod common;

pub use bus::*;
pub use common::*;
