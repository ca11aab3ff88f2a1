//! Host-side utilities: per-instance counters, log sinks and summary export.

pub mod log_sink;
pub mod metrics;
pub mod metrics_export;
