//! telemetry.rs
//! Per-tick telemetry samples and their comma-delimited wire records.
//!
//! - PID:      `elapsedTime,input,reference,error,kp,ki,kd,output`
//! - STEP:     `elapsedTime,absoluteTime,direction,batteryVoltage,input,stepAmplitude,driveValue,appliedStepValue`
//! - DEADBAND: `elapsedTime,driveValue,position,initialPosition,motionDetectedFlag`
//!
//! PID and STEP records have the same arity, so the parser takes the confirmed
//! active mode as a hint and only falls back to field shape without one.

use serde::Serialize;

use crate::device::params::ExperimentMode;
use crate::error::{PlatformError, Result};

/// Lines starting with this are column headers some firmware builds send on start.
const HEADER_PREFIX: &str = "time2sinc";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidSample {
    pub elapsed_s: f64,
    pub input: f64,
    pub reference: f64,
    pub error: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepSample {
    pub elapsed_s: f64,
    pub absolute_s: f64,
    /// 1 forward, 0 reverse.
    pub direction: u8,
    pub battery_voltage: f64,
    pub input: f64,
    pub amplitude: f64,
    pub drive: u16,
    pub applied: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeadbandSample {
    pub elapsed_s: f64,
    pub drive: u16,
    pub position: f64,
    pub initial_position: f64,
    pub motion_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TelemetrySample {
    Pid(PidSample),
    Step(StepSample),
    Deadband(DeadbandSample),
}

impl TelemetrySample {
    pub fn mode(&self) -> ExperimentMode {
        match self {
            TelemetrySample::Pid(_) => ExperimentMode::Pid,
            TelemetrySample::Step(_) => ExperimentMode::Step,
            TelemetrySample::Deadband(_) => ExperimentMode::Deadband,
        }
    }

    pub fn elapsed_s(&self) -> f64 {
        match self {
            TelemetrySample::Pid(s) => s.elapsed_s,
            TelemetrySample::Step(s) => s.elapsed_s,
            TelemetrySample::Deadband(s) => s.elapsed_s,
        }
    }

    /// Column names for a mode's log file, without the leading timestamp.
    pub fn columns(mode: ExperimentMode) -> &'static [&'static str] {
        match mode {
            ExperimentMode::Pid => &[
                "elapsed_time", "input", "reference", "error", "kp", "ki", "kd", "output",
            ],
            ExperimentMode::Step => &[
                "elapsed_time",
                "absolute_time",
                "direction",
                "battery_voltage",
                "input",
                "step_amplitude",
                "drive",
                "applied_step",
            ],
            ExperimentMode::Deadband => &[
                "elapsed_time", "drive", "position", "initial_position", "motion_detected",
            ],
            ExperimentMode::Idle => &[],
        }
    }

    pub fn fields(&self) -> Vec<String> {
        match self {
            TelemetrySample::Pid(s) => vec![
                format!("{:.3}", s.elapsed_s),
                format!("{:.4}", s.input),
                format!("{:.4}", s.reference),
                format!("{:.4}", s.error),
                format!("{:.4}", s.kp),
                format!("{:.4}", s.ki),
                format!("{:.4}", s.kd),
                format!("{:.4}", s.output),
            ],
            TelemetrySample::Step(s) => vec![
                format!("{:.3}", s.elapsed_s),
                format!("{:.3}", s.absolute_s),
                s.direction.to_string(),
                format!("{:.3}", s.battery_voltage),
                format!("{:.4}", s.input),
                format!("{:.4}", s.amplitude),
                s.drive.to_string(),
                format!("{:.4}", s.applied),
            ],
            TelemetrySample::Deadband(s) => vec![
                format!("{:.3}", s.elapsed_s),
                s.drive.to_string(),
                format!("{:.4}", s.position),
                format!("{:.4}", s.initial_position),
                (s.motion_detected as u8).to_string(),
            ],
        }
    }

    pub fn to_record(&self) -> String {
        self.fields().join(",")
    }

    /// Parse one record. `Ok(None)` for blank and header lines.
    ///
    /// `hint` is the instance's confirmed active mode (`Idle` when unknown).
    pub fn parse(line: &str, hint: ExperimentMode) -> Result<Option<TelemetrySample>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(HEADER_PREFIX) {
            return Ok(None);
        }

        let mut values = Vec::with_capacity(8);
        for field in line.split(',') {
            let v: f64 = field
                .trim()
                .parse()
                .map_err(|_| PlatformError::protocol(line, format!("non-numeric field {field:?}")))?;
            if !v.is_finite() {
                return Err(PlatformError::protocol(line, "non-finite field"));
            }
            values.push(v);
        }

        let sample = match values.len() {
            5 => TelemetrySample::Deadband(deadband_from(&values)),
            7 => {
                // legacy step record without appliedStepValue
                values.push(values[5]);
                TelemetrySample::Step(step_from(&values))
            }
            8 => match hint {
                ExperimentMode::Pid => TelemetrySample::Pid(pid_from(&values)),
                ExperimentMode::Step => TelemetrySample::Step(step_from(&values)),
                _ if looks_like_step(&values) => TelemetrySample::Step(step_from(&values)),
                _ => TelemetrySample::Pid(pid_from(&values)),
            },
            n => return Err(PlatformError::protocol(line, format!("unexpected field count {n}"))),
        };
        Ok(Some(sample))
    }
}

fn is_integral(v: f64) -> bool {
    v.fract() == 0.0
}

/// Step records carry absoluteTime >= elapsedTime and an integral 0/1 direction.
fn looks_like_step(v: &[f64]) -> bool {
    is_integral(v[2]) && (v[2] == 0.0 || v[2] == 1.0) && v[1] >= v[0] && is_integral(v[6])
}

fn drive_from(v: f64) -> u16 {
    v.round().clamp(0.0, u16::MAX as f64) as u16
}

fn pid_from(v: &[f64]) -> PidSample {
    PidSample {
        elapsed_s: v[0],
        input: v[1],
        reference: v[2],
        error: v[3],
        kp: v[4],
        ki: v[5],
        kd: v[6],
        output: v[7],
    }
}

fn step_from(v: &[f64]) -> StepSample {
    StepSample {
        elapsed_s: v[0],
        absolute_s: v[1],
        direction: if v[2] >= 0.5 { 1 } else { 0 },
        battery_voltage: v[3],
        input: v[4],
        amplitude: v[5],
        drive: drive_from(v[6]),
        applied: v[7],
    }
}

fn deadband_from(v: &[f64]) -> DeadbandSample {
    DeadbandSample {
        elapsed_s: v[0],
        drive: drive_from(v[1]),
        position: v[2],
        initial_position: v[3],
        motion_detected: v[4] >= 0.5,
    }
}
