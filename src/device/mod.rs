//! Device side: firmware logic of one train, run against a `Hal`.
//!
//! params -> control/step/deadband -> state machine -> node loop, with telemetry
//! going out through the emitter.

pub mod control;
pub mod deadband;
pub mod emitter;
pub mod hal;
pub mod node;
pub mod params;
pub mod state;
pub mod step;
