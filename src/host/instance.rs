//! instance.rs
//! Mutable host-side state of one instance, behind one lock.
//!
//! Shared by the receiver, the router consumer and the parameter sync worker.
//! Holders copy what they need and release the lock before any I/O.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Instant,
};

use parking_lot::Mutex;

use crate::device::deadband::CalibrationResult;
use crate::device::params::{ExperimentMode, ParamKey};
use crate::telemetry::TelemetrySample;
use crate::utils::metrics::{ConnectionStatus, InstanceStats};

/// A value the device reported as applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterConfirmation {
    pub key: ParamKey,
    pub value: f64,
    pub at: Instant,
}

#[derive(Debug, Default)]
pub struct InstanceState {
    pub latest: Option<TelemetrySample>,
    pub stats: InstanceStats,
    /// Last value confirmed by the device, per key. The only source of truth for "applied".
    pub confirmed: BTreeMap<ParamKey, ParameterConfirmation>,
    /// Last value this host sent, per key.
    pub commanded: BTreeMap<ParamKey, f64>,
    /// Mode the device confirmed as running.
    pub active_mode: Option<ExperimentMode>,
    /// Label of the log sink currently receiving samples.
    pub sink_label: Option<String>,
    pub calibration: Option<CalibrationResult>,
    pub calibration_error: Option<String>,
    /// Drive of the first flagged deadband sample seen in telemetry.
    pub detected_deadband: Option<u16>,
    pub channel_connected: bool,
}

pub type SharedInstance = Arc<Mutex<InstanceState>>;

impl InstanceState {
    pub fn shared() -> SharedInstance {
        Arc::new(Mutex::new(InstanceState::default()))
    }

    /// Parser hint for 8-field records.
    pub fn mode_hint(&self) -> ExperimentMode {
        self.active_mode.unwrap_or(ExperimentMode::Idle)
    }

    pub fn confirmed_value(&self, key: ParamKey) -> Option<f64> {
        self.confirmed.get(&key).map(|c| c.value)
    }

    /// Confirmed values of one mode, in key order.
    pub fn confirmed_set(&self, mode: ExperimentMode) -> Vec<(ParamKey, f64)> {
        self.confirmed
            .values()
            .filter(|c| c.key.mode() == mode)
            .map(|c| (c.key, c.value))
            .collect()
    }

    /// Commanded values the device has not confirmed (yet).
    pub fn unconfirmed(&self) -> Vec<(ParamKey, f64)> {
        self.commanded
            .iter()
            .filter(|(k, v)| self.confirmed_value(**k) != Some(**v))
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    /// Called by the router consumer for every dequeued sample.
    pub fn update_latest(&mut self, sample: TelemetrySample) {
        if let TelemetrySample::Deadband(s) = &sample {
            // one flagged sample per run; a new run supersedes the previous value
            if s.motion_detected {
                self.detected_deadband = Some(s.drive);
            }
        }
        self.latest = Some(sample);
    }

    pub fn connection_status(&self, now: Instant) -> ConnectionStatus {
        self.stats.connection_status(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfirmed_tracks_commanded_vs_confirmed() {
        let mut st = InstanceState::default();
        st.commanded.insert(ParamKey::Kp, 10.0);
        st.commanded.insert(ParamKey::Ki, 2.0);
        st.confirmed.insert(
            ParamKey::Kp,
            ParameterConfirmation { key: ParamKey::Kp, value: 10.0, at: Instant::now() },
        );
        assert_eq!(st.unconfirmed(), vec![(ParamKey::Ki, 2.0)]);
        assert_eq!(st.confirmed_set(ExperimentMode::Pid), vec![(ParamKey::Kp, 10.0)]);
        assert!(st.confirmed_set(ExperimentMode::Step).is_empty());
    }

    fn ramp(drive: u16, motion_detected: bool) -> TelemetrySample {
        TelemetrySample::Deadband(crate::telemetry::DeadbandSample {
            elapsed_s: 0.0,
            drive,
            position: 20.0,
            initial_position: 20.0,
            motion_detected,
        })
    }

    #[test]
    fn detected_deadband_follows_the_latest_flagged_sample() {
        let mut st = InstanceState::default();
        st.update_latest(ramp(60, false));
        assert_eq!(st.detected_deadband, None);
        st.update_latest(ramp(100, true));
        st.update_latest(ramp(10, false));
        assert_eq!(st.detected_deadband, Some(100));
        // next run
        st.update_latest(ramp(90, true));
        assert_eq!(st.detected_deadband, Some(90));
    }
}
