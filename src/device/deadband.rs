//! deadband.rs
//! Deadband auto-calibration: ramp the drive until the train moves.
//!
//! Tick driven so it shares the device loop with the other modes:
//! - SETTLE: motor off, average `settle_readings` positions -> initial position
//! - RAMP: raise drive by `increment`, wait `settle_ticks`, average `step_readings`
//!   positions, compare against the initial position
//!
//! The drive rises on every ramp step regardless of what the readings say, so the
//! run ends either on detection or at the ceiling.

use average::Mean;
use serde::{Deserialize, Serialize};

use crate::device::params::DeadbandParams;

/// Outcome of a successful calibration. Kept until the next run replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub drive: u16,
    pub initial_position: f64,
    pub final_position: f64,
}

impl CalibrationResult {
    pub fn delta(&self) -> f64 {
        (self.final_position - self.initial_position).abs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    Detected(CalibrationResult),
    /// Ramp passed the ceiling; `drive` is the last value tried.
    TimedOut { drive: u16 },
}

/// One averaged measurement taken during the ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSample {
    pub drive: u16,
    pub position: f64,
    pub initial_position: f64,
    pub motion_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadbandTick {
    /// Drive to apply for this tick.
    pub drive: u16,
    pub sample: Option<RampSample>,
    pub outcome: Option<CalibrationOutcome>,
}

#[derive(Debug, Clone)]
enum Phase {
    Settle,
    Ramp { drive: u16, wait: u32 },
    Finished,
}

#[derive(Debug, Clone)]
pub struct Calibrator {
    phase: Phase,
    readings: Vec<f64>,
    initial_position: Option<f64>,
}

fn mean(values: &[f64]) -> f64 {
    let m: Mean = values.iter().copied().collect();
    m.mean()
}

impl Calibrator {
    pub fn start() -> Self {
        Self {
            phase: Phase::Settle,
            readings: Vec::new(),
            initial_position: None,
        }
    }

    pub fn initial_position(&self) -> Option<f64> {
        self.initial_position
    }

    pub fn current_drive(&self) -> u16 {
        match self.phase {
            Phase::Ramp { drive, .. } => drive,
            _ => 0,
        }
    }

    /// Feed one position reading taken under the previous tick's drive.
    pub fn tick(&mut self, params: &DeadbandParams, reading: f64) -> DeadbandTick {
        match self.phase {
            Phase::Finished => DeadbandTick { drive: 0, sample: None, outcome: None },
            Phase::Settle => {
                self.readings.push(reading);
                if self.readings.len() < params.settle_readings as usize {
                    return DeadbandTick { drive: 0, sample: None, outcome: None };
                }
                self.initial_position = Some(mean(&self.readings));
                self.readings.clear();
                let drive = params.increment.min(params.ceiling);
                self.phase = Phase::Ramp { drive, wait: params.settle_ticks };
                DeadbandTick { drive, sample: None, outcome: None }
            }
            Phase::Ramp { drive, wait } => {
                if wait > 0 {
                    self.phase = Phase::Ramp { drive, wait: wait - 1 };
                    return DeadbandTick { drive, sample: None, outcome: None };
                }
                self.readings.push(reading);
                if self.readings.len() < params.step_readings as usize {
                    return DeadbandTick { drive, sample: None, outcome: None };
                }
                self.measure(params, drive)
            }
        }
    }

    fn measure(&mut self, params: &DeadbandParams, drive: u16) -> DeadbandTick {
        let initial_position = self.initial_position.unwrap_or_default();
        let position = mean(&self.readings);
        self.readings.clear();

        let moved = (position - initial_position).abs() >= params.motion_threshold;
        let motion_detected = moved && drive > params.noise_floor;
        let sample = RampSample { drive, position, initial_position, motion_detected };

        if motion_detected {
            self.phase = Phase::Finished;
            let result = CalibrationResult { drive, initial_position, final_position: position };
            return DeadbandTick {
                drive,
                sample: Some(sample),
                outcome: Some(CalibrationOutcome::Detected(result)),
            };
        }

        let next = drive.saturating_add(params.increment.max(1));
        if next > params.ceiling || next == drive {
            self.phase = Phase::Finished;
            return DeadbandTick {
                drive,
                sample: Some(sample),
                outcome: Some(CalibrationOutcome::TimedOut { drive }),
            };
        }

        self.phase = Phase::Ramp { drive: next, wait: params.settle_ticks };
        DeadbandTick { drive: next, sample: Some(sample), outcome: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DeadbandParams {
        DeadbandParams {
            settle_readings: 4,
            step_readings: 2,
            settle_ticks: 1,
            increment: 10,
            ..DeadbandParams::default()
        }
    }

    /// Drives the calibrator with a position that depends on the drive it commanded.
    fn run(params: &DeadbandParams, position: impl Fn(u16) -> f64) -> (Vec<RampSample>, CalibrationOutcome) {
        let mut cal = Calibrator::start();
        let mut drive = 0;
        let mut samples = Vec::new();
        for _ in 0..10_000 {
            let t = cal.tick(params, position(drive));
            drive = t.drive;
            samples.extend(t.sample);
            if let Some(outcome) = t.outcome {
                return (samples, outcome);
            }
        }
        panic!("calibration never finished");
    }

    #[test]
    fn initial_position_is_the_settle_mean() {
        let p = params();
        let mut cal = Calibrator::start();
        for r in [20.0, 21.0, 20.5, 20.5] {
            cal.tick(&p, r);
        }
        assert_eq!(cal.initial_position(), Some(20.5));
        assert_eq!(cal.current_drive(), 10);
    }

    #[test]
    fn noise_below_floor_is_ignored() {
        let p = params();
        // big jumps at low drive, real motion from 100 on
        let (samples, outcome) = run(&p, |d| match d {
            10..=49 => 21.3,
            100.. => 19.96,
            _ => 20.68,
        });
        match outcome {
            CalibrationOutcome::Detected(r) => {
                assert_eq!(r.drive, 100);
                assert!((r.delta() - 0.72).abs() < 1e-9);
                assert!((r.initial_position - 20.68).abs() < 1e-9);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let flagged: Vec<_> = samples.iter().filter(|s| s.motion_detected).collect();
        assert_eq!(flagged.len(), 1);
        assert!(samples.last().is_some_and(|s| s.motion_detected && s.drive == 100));
    }

    #[test]
    fn ramp_times_out_at_ceiling() {
        let p = DeadbandParams { ceiling: 60, ..params() };
        let (samples, outcome) = run(&p, |_| 20.0);
        assert_eq!(outcome, CalibrationOutcome::TimedOut { drive: 60 });
        assert!(samples.iter().all(|s| !s.motion_detected));
        assert_eq!(samples.len(), 6);
    }
}
