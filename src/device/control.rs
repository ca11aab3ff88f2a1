//! control.rs
//! Control loop engine: PID compute, deadzone/deadband handling and warm-up gating.
//!
//! The drive decision lives in one pure function, `decide_drive`, called exactly once
//! per tick. Gain updates take effect on the next tick and keep the integral term;
//! only `reconfigure` (mode activation) clears it.

use pid::Pid;

use crate::device::params::{Direction, PidParams};

/// Motor command for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveCommand {
    pub drive: u16,
    pub direction: Direction,
}

impl DriveCommand {
    pub fn off(direction: Direction) -> Self {
        Self { drive: 0, direction }
    }
}

/// (rawOutput, lim) -> (drive, direction).
///
/// Inside the deadzone the motor is off and the previous direction is kept.
/// Outside it the direction follows the sign of the output and the deadband
/// compensation is added to the magnitude before clamping to `max`.
pub fn decide_drive(
    raw_output: f64,
    lim: f64,
    compensation: f64,
    max: u16,
    previous: Direction,
) -> DriveCommand {
    if !raw_output.is_finite() || raw_output.abs() < lim || raw_output == 0.0 {
        return DriveCommand::off(previous);
    }
    let direction = if raw_output > 0.0 {
        Direction::Forward
    } else {
        Direction::Reverse
    };
    let drive = (raw_output.abs() + compensation)
        .clamp(0.0, max as f64)
        .round() as u16;
    DriveCommand { drive, direction }
}

/// Result of one control tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlStep {
    pub raw_output: f64,
    /// input - reference.
    pub error: f64,
    pub command: DriveCommand,
    /// False while warming up: the sample must not be emitted.
    pub emit: bool,
}

pub struct ControlLoop {
    pid: Pid<f64>,
    direction: Direction,
    warmup_remaining: u32,
}

impl ControlLoop {
    pub fn new(params: &PidParams) -> Self {
        let limit = params.output_max as f64;
        let mut pid = Pid::new(-params.reference, limit);
        pid.p(params.kp, limit).i(params.ki, limit).d(params.kd, limit);
        Self {
            pid,
            direction: Direction::Forward,
            warmup_remaining: params.warmup_ticks,
        }
    }

    /// Push new gains/reference into the running controller. The integral term survives.
    pub fn apply_gains(&mut self, params: &PidParams) {
        let limit = params.output_max as f64;
        self.pid.output_limit = limit;
        self.pid
            .p(params.kp, limit)
            .i(params.ki, limit)
            .d(params.kd, limit)
            .setpoint(-params.reference);
    }

    /// Explicit reconfiguration: new gains, cleared integral, fresh warm-up.
    pub fn reconfigure(&mut self, params: &PidParams) {
        *self = ControlLoop {
            direction: self.direction,
            ..ControlLoop::new(params)
        };
        self.pid.reset_integral_term();
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn warming_up(&self) -> bool {
        self.warmup_remaining > 0
    }

    /// One tick. During warm-up the controller is not stepped and the motor stays off.
    pub fn compute(&mut self, params: &PidParams, measurement: f64) -> ControlStep {
        let error = measurement - params.reference;
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return ControlStep {
                raw_output: 0.0,
                error,
                command: DriveCommand::off(self.direction),
                emit: false,
            };
        }

        // The controller runs on negated signals so that its error is input - reference.
        let raw_output = self.pid.next_control_output(-measurement).output;
        let command = decide_drive(
            raw_output,
            params.lim,
            params.deadband,
            params.output_max,
            self.direction,
        );
        self.direction = command.direction;

        ControlStep {
            raw_output,
            error,
            command,
            emit: true,
        }
    }
}
