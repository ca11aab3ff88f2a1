//! Parameter channel shared by device and host: topic layout, pub/sub transport
//! and reconnect backoff.

pub mod backoff;
pub mod bus;
pub mod topic;
