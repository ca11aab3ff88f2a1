//! state.rs
//! Experiment state machine of one device.
//!
//! - Parameter writes are accepted for every mode at any time and confirmed with
//!   the clamped value.
//! - Starting a mode checks that mode's parameters; a rejected start changes
//!   nothing and is answered with a `false` activation status.
//! - Starting while another mode runs is stop-then-start. Stop while idle is a no-op.
//! - `tick` runs the active mode once and reports what to emit and publish.

use log::{info, warn};

use crate::device::control::{ControlLoop, DriveCommand};
use crate::device::deadband::{CalibrationOutcome, CalibrationResult, Calibrator};
use crate::device::params::{ExperimentMode, ParamKey, ParameterSet};
use crate::device::step::StepRun;
use crate::error::PlatformError;
use crate::telemetry::{DeadbandSample, PidSample, StepSample, TelemetrySample};

/// Commands decoded from the parameter channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    SetParam(ParamKey, f64),
    Start(ExperimentMode),
    Stop(ExperimentMode),
    RequestParams(ExperimentMode),
    ApplyDeadband,
}

/// Things the device publishes back to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    Confirm { key: ParamKey, value: f64 },
    Activation { mode: ExperimentMode, active: bool },
    CalibrationDone(CalibrationResult),
    CalibrationFailed(String),
    DeadbandApplied(f64),
}

/// Result of one tick. The sample goes out before the motor command is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput {
    pub command: DriveCommand,
    pub sample: Option<TelemetrySample>,
    pub announcements: Vec<Announcement>,
}

/// Mode-local state, rebuilt on every activation.
enum Run {
    Idle,
    Pid,
    Step(StepRun),
    Deadband(Calibrator),
}

pub struct ExperimentMachine {
    params: ParameterSet,
    run: Run,
    control: ControlLoop,
    calibration: Option<CalibrationResult>,
    period_ms: u64,
    /// Ticks since boot.
    boot_ticks: u64,
    /// Ticks since the current mode was activated.
    mode_ticks: u64,
}

impl ExperimentMachine {
    pub fn new(params: ParameterSet) -> Self {
        let control = ControlLoop::new(&params.pid);
        let period_ms = params.pid.sample_period_ms.max(1);
        Self {
            params,
            run: Run::Idle,
            control,
            calibration: None,
            period_ms,
            boot_ticks: 0,
            mode_ticks: 0,
        }
    }

    pub fn mode(&self) -> ExperimentMode {
        match self.run {
            Run::Idle => ExperimentMode::Idle,
            Run::Pid => ExperimentMode::Pid,
            Run::Step(_) => ExperimentMode::Step,
            Run::Deadband(_) => ExperimentMode::Deadband,
        }
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn calibration(&self) -> Option<CalibrationResult> {
        self.calibration
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    fn seconds(&self, ticks: u64) -> f64 {
        ticks as f64 * self.period_ms as f64 / 1000.0
    }

    pub fn handle(&mut self, cmd: DeviceCommand) -> Vec<Announcement> {
        match cmd {
            DeviceCommand::SetParam(key, value) => vec![self.set_param(key, value)],
            DeviceCommand::Start(mode) => self.start(mode),
            DeviceCommand::Stop(mode) => self.stop(mode),
            DeviceCommand::RequestParams(mode) => self.resync(mode),
            DeviceCommand::ApplyDeadband => self.apply_deadband(),
        }
    }

    fn set_param(&mut self, key: ParamKey, value: f64) -> Announcement {
        let (stored, warning) = self.params.set(key, value);
        if let Some(w) = warning {
            warn!("{}", w);
        }
        if key.mode() == ExperimentMode::Pid && matches!(self.run, Run::Pid) {
            self.control.apply_gains(&self.params.pid);
        }
        Announcement::Confirm { key, value: stored }
    }

    fn start(&mut self, mode: ExperimentMode) -> Vec<Announcement> {
        if mode == ExperimentMode::Idle {
            return Vec::new();
        }
        if let Err(reason) = self.params.validate(mode) {
            let err = PlatformError::State { mode, reason };
            warn!("{}", err);
            // the status reports what is running; a running mode stays active
            return vec![Announcement::Activation { mode, active: self.mode() == mode }];
        }

        let mut out = Vec::new();
        let current = self.mode();
        if current != ExperimentMode::Idle && current != mode {
            out.extend(self.stop(current));
        }

        self.mode_ticks = 0;
        self.run = match mode {
            ExperimentMode::Pid => {
                self.control.reconfigure(&self.params.pid);
                Run::Pid
            }
            ExperimentMode::Step => Run::Step(StepRun::start(&self.params.step, self.period_ms)),
            ExperimentMode::Deadband => Run::Deadband(Calibrator::start()),
            ExperimentMode::Idle => Run::Idle,
        };
        info!("{:?} activated", mode);
        out.push(Announcement::Activation { mode, active: true });
        out
    }

    fn stop(&mut self, mode: ExperimentMode) -> Vec<Announcement> {
        let current = self.mode();
        if current == ExperimentMode::Idle || current != mode {
            return Vec::new();
        }
        self.run = Run::Idle;
        info!("{:?} stopped", mode);
        vec![Announcement::Activation { mode, active: false }]
    }

    /// Republish every parameter of `mode` plus its activation status.
    fn resync(&self, mode: ExperimentMode) -> Vec<Announcement> {
        let mut out: Vec<Announcement> = self
            .params
            .snapshot(mode)
            .into_iter()
            .map(|(key, value)| Announcement::Confirm { key, value })
            .collect();
        if mode != ExperimentMode::Idle {
            out.push(Announcement::Activation { mode, active: self.mode() == mode });
        }
        out
    }

    fn apply_deadband(&mut self) -> Vec<Announcement> {
        let Some(result) = self.calibration else {
            warn!("deadband apply requested without a calibration result");
            return vec![Announcement::CalibrationFailed("no calibration result".into())];
        };
        let confirm = self.set_param(ParamKey::DeadbandCompensation, result.drive as f64);
        let value = self.params.pid.deadband;
        vec![confirm, Announcement::DeadbandApplied(value)]
    }

    /// One control period. `distance` and `supply_voltage` are this tick's readings.
    pub fn tick(&mut self, distance: f64, supply_voltage: f64) -> TickOutput {
        self.boot_ticks += 1;
        let elapsed_s = self.seconds(self.mode_ticks);
        self.mode_ticks += 1;

        match &mut self.run {
            Run::Idle => TickOutput {
                command: DriveCommand::off(self.control.direction()),
                sample: None,
                announcements: Vec::new(),
            },

            Run::Pid => {
                let pid = &self.params.pid;
                let step = self.control.compute(pid, distance);
                let sample = step.emit.then(|| {
                    TelemetrySample::Pid(PidSample {
                        elapsed_s,
                        input: distance,
                        reference: pid.reference,
                        error: step.error,
                        kp: pid.kp,
                        ki: pid.ki,
                        kd: pid.kd,
                        output: step.raw_output,
                    })
                });
                TickOutput { command: step.command, sample, announcements: Vec::new() }
            }

            Run::Step(run) => {
                let params = &self.params.step;
                let t = run.tick(params);
                let sample = t.emit.then(|| {
                    TelemetrySample::Step(StepSample {
                        elapsed_s,
                        absolute_s: self.boot_ticks as f64 * self.period_ms as f64 / 1000.0,
                        direction: params.direction.as_value(),
                        battery_voltage: supply_voltage,
                        input: distance,
                        amplitude: params.amplitude,
                        drive: t.drive,
                        applied: t.applied,
                    })
                });
                let direction = params.direction;
                if t.finished {
                    self.run = Run::Idle;
                    info!("step run finished after {:.2} s", elapsed_s);
                    return TickOutput {
                        command: DriveCommand::off(direction),
                        sample,
                        announcements: vec![Announcement::Activation {
                            mode: ExperimentMode::Step,
                            active: false,
                        }],
                    };
                }
                TickOutput {
                    command: DriveCommand { drive: t.drive, direction },
                    sample,
                    announcements: Vec::new(),
                }
            }

            Run::Deadband(cal) => {
                let direction = self.params.deadband.direction;
                let t = cal.tick(&self.params.deadband, distance);
                let sample = t.sample.map(|s| {
                    TelemetrySample::Deadband(DeadbandSample {
                        elapsed_s,
                        drive: s.drive,
                        position: s.position,
                        initial_position: s.initial_position,
                        motion_detected: s.motion_detected,
                    })
                });
                match t.outcome {
                    None => TickOutput {
                        command: DriveCommand { drive: t.drive, direction },
                        sample,
                        announcements: Vec::new(),
                    },
                    Some(outcome) => {
                        self.run = Run::Idle;
                        let announcements = self.finish_calibration(outcome);
                        TickOutput { command: DriveCommand::off(direction), sample, announcements }
                    }
                }
            }
        }
    }

    fn finish_calibration(&mut self, outcome: CalibrationOutcome) -> Vec<Announcement> {
        let mut out = Vec::new();
        match outcome {
            CalibrationOutcome::Detected(result) => {
                info!(
                    "deadband detected at drive {} (moved {:.2} cm)",
                    result.drive,
                    result.delta()
                );
                self.calibration = Some(result);
                out.push(Announcement::CalibrationDone(result));
            }
            CalibrationOutcome::TimedOut { drive } => {
                let fallback = self.params.deadband.fallback;
                let err = PlatformError::CalibrationTimeout { drive, fallback };
                warn!("{}", err);
                out.push(self.set_param(ParamKey::DeadbandCompensation, fallback));
                out.push(Announcement::CalibrationFailed(err.to_string()));
            }
        }
        out.push(Announcement::Activation { mode: ExperimentMode::Deadband, active: false });
        out
    }
}
