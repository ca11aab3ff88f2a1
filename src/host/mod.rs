//! Host side: one session per configured instance, each with its own namespace,
//! telemetry receiver, data router and parameter sync client.

pub mod instance;
pub mod namespace;
pub mod param_sync;
pub mod receiver;
pub mod router;
pub mod session;
