//! params.rs
//! Experiment modes and the per-mode parameter sets.
//!
//! Every mode owns its own parameter struct. Writes are accepted for any mode at
//! any time (clamped into range); validity is only checked when a mode is started.

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

/// Full-scale motor drive (8-bit PWM).
pub const DRIVE_MAX: u16 = 255;
/// Control tick period on the device.
pub const SAMPLE_PERIOD_MS: u64 = 20;
/// Ticks discarded after a driving mode is activated.
pub const PID_WARMUP_TICKS: u32 = 10;
pub const STEP_WARMUP_SAMPLES: u32 = 10;
pub const STEP_BASELINE_SAMPLES: u32 = 20;
/// Compensation used when calibration fails.
pub const DEFAULT_DEADBAND: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExperimentMode {
    Idle,
    Pid,
    Step,
    Deadband,
}

impl ExperimentMode {
    /// Modes that can be started.
    pub const ACTIVE: [ExperimentMode; 3] =
        [ExperimentMode::Pid, ExperimentMode::Step, ExperimentMode::Deadband];

    /// Topic segment for this mode.
    pub fn segment(&self) -> &'static str {
        match self {
            ExperimentMode::Idle => "idle",
            ExperimentMode::Pid => "pid",
            ExperimentMode::Step => "step",
            ExperimentMode::Deadband => "deadband",
        }
    }

    pub fn from_segment(s: &str) -> Option<Self> {
        match s {
            "pid" => Some(ExperimentMode::Pid),
            "step" => Some(ExperimentMode::Step),
            "deadband" => Some(ExperimentMode::Deadband),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// Wire value: 1 forward, 0 reverse.
    pub fn as_value(&self) -> u8 {
        match self {
            Direction::Forward => 1,
            Direction::Reverse => 0,
        }
    }

    pub fn from_value(v: f64) -> Self {
        if v >= 0.5 { Direction::Forward } else { Direction::Reverse }
    }
}

/// Every parameter that can be set over the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParamKey {
    Kp,
    Ki,
    Kd,
    Reference,
    DeadbandCompensation,
    Deadzone,
    StepAmplitude,
    StepDuration,
    StepDirection,
    SupplyVoltage,
    CalibrationDirection,
    MotionThreshold,
}

impl ParamKey {
    pub const ALL: [ParamKey; 12] = [
        ParamKey::Kp,
        ParamKey::Ki,
        ParamKey::Kd,
        ParamKey::Reference,
        ParamKey::DeadbandCompensation,
        ParamKey::Deadzone,
        ParamKey::StepAmplitude,
        ParamKey::StepDuration,
        ParamKey::StepDirection,
        ParamKey::SupplyVoltage,
        ParamKey::CalibrationDirection,
        ParamKey::MotionThreshold,
    ];

    pub fn mode(&self) -> ExperimentMode {
        match self {
            ParamKey::Kp
            | ParamKey::Ki
            | ParamKey::Kd
            | ParamKey::Reference
            | ParamKey::DeadbandCompensation
            | ParamKey::Deadzone => ExperimentMode::Pid,
            ParamKey::StepAmplitude
            | ParamKey::StepDuration
            | ParamKey::StepDirection
            | ParamKey::SupplyVoltage => ExperimentMode::Step,
            ParamKey::CalibrationDirection | ParamKey::MotionThreshold => ExperimentMode::Deadband,
        }
    }

    /// Topic segment under the mode segment.
    pub fn name(&self) -> &'static str {
        match self {
            ParamKey::Kp => "kp",
            ParamKey::Ki => "ki",
            ParamKey::Kd => "kd",
            ParamKey::Reference => "reference",
            ParamKey::DeadbandCompensation => "deadband",
            ParamKey::Deadzone => "lim",
            ParamKey::StepAmplitude => "amplitude",
            ParamKey::StepDuration => "time",
            ParamKey::StepDirection | ParamKey::CalibrationDirection => "direction",
            ParamKey::SupplyVoltage => "vbatt",
            ParamKey::MotionThreshold => "threshold",
        }
    }

    pub fn for_mode(mode: ExperimentMode) -> impl Iterator<Item = ParamKey> {
        ParamKey::ALL.into_iter().filter(move |k| k.mode() == mode)
    }

    pub fn lookup(mode: ExperimentMode, name: &str) -> Option<ParamKey> {
        ParamKey::for_mode(mode).find(|k| k.name() == name)
    }

    /// Device-side admissible range.
    pub fn range(&self) -> (f64, f64) {
        match self {
            ParamKey::Kp => (0.0, 250.0),
            ParamKey::Ki => (0.0, 150.0),
            ParamKey::Kd => (0.0, 150.0),
            ParamKey::Reference => (1.0, 100.0),
            ParamKey::DeadbandCompensation => (0.0, DRIVE_MAX as f64),
            ParamKey::Deadzone => (0.0, DRIVE_MAX as f64),
            ParamKey::StepAmplitude => (0.0, 12.0),
            ParamKey::StepDuration => (0.0, 60.0),
            ParamKey::StepDirection | ParamKey::CalibrationDirection => (0.0, 1.0),
            ParamKey::SupplyVoltage => (1.0, 12.0),
            ParamKey::MotionThreshold => (0.05, 10.0),
        }
    }

    /// Clamp into `range()`. Non-finite input falls back to the lower bound.
    pub fn clamp_value(&self, value: f64) -> (f64, Option<PlatformError>) {
        let (lo, hi) = self.range();
        clamp_into(self.name(), value, lo, hi)
    }
}

pub(crate) fn clamp_into(name: &str, value: f64, lo: f64, hi: f64) -> (f64, Option<PlatformError>) {
    let clamped = if value.is_finite() { value.clamp(lo, hi) } else { lo };
    if clamped == value {
        (clamped, None)
    } else {
        (
            clamped,
            Some(PlatformError::Validation {
                key: name.to_string(),
                requested: value,
                clamped,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidParams {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Target distance (cm).
    pub reference: f64,
    /// Added to |output| to overcome static friction.
    pub deadband: f64,
    /// Outputs below this magnitude command no drive.
    pub lim: f64,
    pub output_max: u16,
    pub sample_period_ms: u64,
    pub warmup_ticks: u32,
}

impl Default for PidParams {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            reference: 10.0,
            deadband: DEFAULT_DEADBAND,
            lim: 5.0,
            output_max: DRIVE_MAX,
            sample_period_ms: SAMPLE_PERIOD_MS,
            warmup_ticks: PID_WARMUP_TICKS,
        }
    }
}

impl PidParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.kp == 0.0 && self.ki == 0.0 && self.kd == 0.0 {
            return Err("all gains are zero".into());
        }
        if self.reference <= 0.0 {
            return Err(format!("reference {} must be positive", self.reference));
        }
        if self.sample_period_ms == 0 {
            return Err("sample period is zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParams {
    /// Step input (V) applied after the baseline.
    pub amplitude: f64,
    /// Commanded step duration (s). Never mutated by a run.
    pub duration_s: f64,
    pub direction: Direction,
    /// Supply voltage used to convert amplitude into drive.
    pub supply_voltage: f64,
    pub warmup_samples: u32,
    pub baseline_samples: u32,
}

impl Default for StepParams {
    fn default() -> Self {
        Self {
            amplitude: 0.0,
            duration_s: 0.0,
            direction: Direction::Forward,
            supply_voltage: 8.4,
            warmup_samples: STEP_WARMUP_SAMPLES,
            baseline_samples: STEP_BASELINE_SAMPLES,
        }
    }
}

impl StepParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.amplitude <= 0.0 {
            return Err("step amplitude is zero".into());
        }
        if self.duration_s <= 0.0 {
            return Err("step duration is zero".into());
        }
        if self.supply_voltage <= 0.0 {
            return Err("supply voltage is zero".into());
        }
        Ok(())
    }

    /// Drive for an applied step value, scaled by supply voltage.
    pub fn drive_for(&self, applied: f64) -> u16 {
        if self.supply_voltage <= 0.0 {
            return 0;
        }
        let drive = (applied / self.supply_voltage * DRIVE_MAX as f64).round();
        drive.clamp(0.0, DRIVE_MAX as f64) as u16
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadbandParams {
    pub direction: Direction,
    /// Minimum |Δposition| (cm) that counts as motion.
    pub motion_threshold: f64,
    /// Readings averaged for the initial position.
    pub settle_readings: u32,
    /// Readings averaged after each ramp step.
    pub step_readings: u32,
    pub increment: u16,
    /// Ticks waited after each increment.
    pub settle_ticks: u32,
    /// Detections at or below this drive are treated as noise.
    pub noise_floor: u16,
    /// Abort once the ramp exceeds this drive.
    pub ceiling: u16,
    pub fallback: f64,
}

impl Default for DeadbandParams {
    fn default() -> Self {
        Self {
            direction: Direction::Forward,
            motion_threshold: 0.5,
            settle_readings: 10,
            step_readings: 3,
            increment: 1,
            settle_ticks: 5,
            noise_floor: 50,
            ceiling: DRIVE_MAX,
            fallback: DEFAULT_DEADBAND,
        }
    }
}

impl DeadbandParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.motion_threshold <= 0.0 {
            return Err("motion threshold is zero".into());
        }
        if self.increment == 0 {
            return Err("ramp increment is zero".into());
        }
        if self.settle_readings == 0 || self.step_readings == 0 {
            return Err("reading count is zero".into());
        }
        Ok(())
    }
}

/// One parameter struct per mode, all writable regardless of the active mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub pid: PidParams,
    pub step: StepParams,
    pub deadband: DeadbandParams,
}

impl ParameterSet {
    pub fn get(&self, key: ParamKey) -> f64 {
        match key {
            ParamKey::Kp => self.pid.kp,
            ParamKey::Ki => self.pid.ki,
            ParamKey::Kd => self.pid.kd,
            ParamKey::Reference => self.pid.reference,
            ParamKey::DeadbandCompensation => self.pid.deadband,
            ParamKey::Deadzone => self.pid.lim,
            ParamKey::StepAmplitude => self.step.amplitude,
            ParamKey::StepDuration => self.step.duration_s,
            ParamKey::StepDirection => self.step.direction.as_value() as f64,
            ParamKey::SupplyVoltage => self.step.supply_voltage,
            ParamKey::CalibrationDirection => self.deadband.direction.as_value() as f64,
            ParamKey::MotionThreshold => self.deadband.motion_threshold,
        }
    }

    /// Clamp and store. Returns the stored value and a validation warning when clamped.
    pub fn set(&mut self, key: ParamKey, value: f64) -> (f64, Option<PlatformError>) {
        let (v, warning) = key.clamp_value(value);
        match key {
            ParamKey::Kp => self.pid.kp = v,
            ParamKey::Ki => self.pid.ki = v,
            ParamKey::Kd => self.pid.kd = v,
            ParamKey::Reference => self.pid.reference = v,
            ParamKey::DeadbandCompensation => self.pid.deadband = v,
            ParamKey::Deadzone => self.pid.lim = v,
            ParamKey::StepAmplitude => self.step.amplitude = v,
            ParamKey::StepDuration => self.step.duration_s = v,
            ParamKey::StepDirection => self.step.direction = Direction::from_value(v),
            ParamKey::SupplyVoltage => self.step.supply_voltage = v,
            ParamKey::CalibrationDirection => self.deadband.direction = Direction::from_value(v),
            ParamKey::MotionThreshold => self.deadband.motion_threshold = v,
        }
        (self.get(key), warning)
    }

    pub fn validate(&self, mode: ExperimentMode) -> Result<(), String> {
        match mode {
            ExperimentMode::Idle => Ok(()),
            ExperimentMode::Pid => self.pid.validate(),
            ExperimentMode::Step => self.step.validate(),
            ExperimentMode::Deadband => self.deadband.validate(),
        }
    }

    /// Current value of every channel parameter belonging to `mode`.
    pub fn snapshot(&self, mode: ExperimentMode) -> Vec<(ParamKey, f64)> {
        ParamKey::for_mode(mode).map(|k| (k, self.get(k))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_write_is_clamped_and_reported() {
        let mut set = ParameterSet::default();
        let (stored, warning) = set.set(ParamKey::Kp, 400.0);
        assert_eq!(stored, 250.0);
        assert_eq!(set.pid.kp, 250.0);
        assert!(matches!(warning, Some(PlatformError::Validation { .. })));

        let (stored, warning) = set.set(ParamKey::Reference, -3.0);
        assert_eq!(stored, 1.0);
        assert!(warning.is_some());
    }

    #[test]
    fn in_range_write_has_no_warning() {
        let mut set = ParameterSet::default();
        let (stored, warning) = set.set(ParamKey::Ki, 12.5);
        assert_eq!(stored, 12.5);
        assert!(warning.is_none());
    }

    #[test]
    fn key_clamps_without_storing() {
        let key = ParamKey::Kd;
        let (v, warning) = key.clamp_value(500.0);
        assert_eq!(v, key.range().1);
        assert!(warning.is_some());
        assert_eq!(key.clamp_value(1.5), (1.5, None));
    }

    #[test]
    fn non_finite_values_fall_to_lower_bound() {
        let mut set = ParameterSet::default();
        let (stored, _) = set.set(ParamKey::MotionThreshold, f64::NAN);
        assert_eq!(stored, ParamKey::MotionThreshold.range().0);
    }

    #[test]
    fn defaults_are_not_startable_until_configured() {
        let mut set = ParameterSet::default();
        assert!(set.validate(ExperimentMode::Pid).is_err());
        assert!(set.validate(ExperimentMode::Step).is_err());
        assert!(set.validate(ExperimentMode::Deadband).is_ok());

        set.set(ParamKey::Kp, 50.0);
        set.set(ParamKey::StepAmplitude, 4.0);
        set.set(ParamKey::StepDuration, 2.0);
        assert!(set.validate(ExperimentMode::Pid).is_ok());
        assert!(set.validate(ExperimentMode::Step).is_ok());
    }

    #[test]
    fn keys_resolve_per_mode() {
        assert_eq!(ParamKey::lookup(ExperimentMode::Step, "direction"), Some(ParamKey::StepDirection));
        assert_eq!(
            ParamKey::lookup(ExperimentMode::Deadband, "direction"),
            Some(ParamKey::CalibrationDirection)
        );
        assert_eq!(ParamKey::lookup(ExperimentMode::Pid, "amplitude"), None);
        assert_eq!(ParamKey::for_mode(ExperimentMode::Pid).count(), 6);
    }

    #[test]
    fn step_drive_scales_with_supply() {
        let step = StepParams {
            amplitude: 2.0,
            supply_voltage: 10.0,
            ..StepParams::default()
        };
        assert_eq!(step.drive_for(2.0), 51);
        assert_eq!(step.drive_for(0.0), 0);
        assert_eq!(step.drive_for(20.0), DRIVE_MAX);
    }
}
