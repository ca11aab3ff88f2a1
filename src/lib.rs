//! Multi-instance train control platform.
//!
//! `device` is the firmware logic of one train (control loop, step response,
//! deadband calibration, experiment state machine). `host` manages many such
//! trains at once over a pub/sub parameter `channel` and a per-instance UDP
//! telemetry stream.

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod telemetry;
pub mod utils;

pub use error::{PlatformError, Result};
