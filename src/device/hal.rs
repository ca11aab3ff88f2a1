//! hal.rs
//! Sensor/actuator boundary of the device.
//!
//! The firmware only ever talks to the `Hal` trait. `SimulatedTrain` is a small
//! first-order plant with static friction and sensor noise so the device loop can
//! run in-process; `ScriptedHal` replays a position function of the motor command
//! for deterministic tests.

use rand::random_range;

use crate::device::params::{DRIVE_MAX, Direction};

pub trait Hal: Send {
    /// Distance to the target (cm).
    fn read_distance(&mut self) -> f64;
    /// Supply voltage (V).
    fn read_supply_voltage(&mut self) -> f64;
    fn set_motor(&mut self, drive: u16, direction: Direction);
}

/// Simulated train on a straight track in front of a fixed target.
///
/// Forward drive closes the distance. Below `stiction` the wheels do not move.
#[derive(Debug, Clone)]
pub struct SimulatedTrain {
    pub distance_cm: f64,
    pub stiction: u16,
    /// cm/s at full drive above stiction.
    pub top_speed: f64,
    pub supply_voltage: f64,
    pub noise_cm: f64,
    pub tick_s: f64,
    drive: u16,
    direction: Direction,
}

impl SimulatedTrain {
    pub fn new(distance_cm: f64, tick_s: f64) -> Self {
        Self {
            distance_cm,
            stiction: 90,
            top_speed: 40.0,
            supply_voltage: 8.4,
            noise_cm: 0.05,
            tick_s,
            drive: 0,
            direction: Direction::Forward,
        }
    }

    fn advance(&mut self) {
        if self.drive <= self.stiction {
            return;
        }
        let span = DRIVE_MAX.saturating_sub(self.stiction).max(1) as f64;
        let speed = self.top_speed * (self.drive - self.stiction) as f64 / span;
        let step = speed * self.tick_s;
        match self.direction {
            Direction::Forward => self.distance_cm = (self.distance_cm - step).max(0.0),
            Direction::Reverse => self.distance_cm += step,
        }
    }
}

impl Hal for SimulatedTrain {
    fn read_distance(&mut self) -> f64 {
        // one read per tick: integrate the last command first
        self.advance();
        let noise = if self.noise_cm > 0.0 {
            random_range(-self.noise_cm..self.noise_cm)
        } else {
            0.0
        };
        (self.distance_cm + noise).max(0.0)
    }

    fn read_supply_voltage(&mut self) -> f64 {
        self.supply_voltage
    }

    fn set_motor(&mut self, drive: u16, direction: Direction) {
        self.drive = drive.min(DRIVE_MAX);
        self.direction = direction;
    }
}

type PositionFn = Box<dyn FnMut(u16, Direction) -> f64 + Send>;

/// Deterministic HAL: each read returns `position(drive, direction)` for the
/// current motor command. Every motor write is recorded.
pub struct ScriptedHal {
    position: PositionFn,
    pub supply_voltage: f64,
    pub drive: u16,
    pub direction: Direction,
    pub motor_log: Vec<(u16, Direction)>,
}

impl ScriptedHal {
    pub fn new(position: impl FnMut(u16, Direction) -> f64 + Send + 'static) -> Self {
        Self {
            position: Box::new(position),
            supply_voltage: 8.4,
            drive: 0,
            direction: Direction::Forward,
            motor_log: Vec::new(),
        }
    }

    pub fn constant(distance_cm: f64) -> Self {
        Self::new(move |_, _| distance_cm)
    }
}

impl Hal for ScriptedHal {
    fn read_distance(&mut self) -> f64 {
        (self.position)(self.drive, self.direction)
    }

    fn read_supply_voltage(&mut self) -> f64 {
        self.supply_voltage
    }

    fn set_motor(&mut self, drive: u16, direction: Direction) {
        self.drive = drive;
        self.direction = direction;
        self.motor_log.push((drive, direction));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_stiction_the_train_stays_put() {
        let mut train = SimulatedTrain::new(30.0, 0.02);
        train.noise_cm = 0.0;
        train.set_motor(train.stiction, Direction::Forward);
        for _ in 0..50 {
            assert_eq!(train.read_distance(), 30.0);
        }
    }

    #[test]
    fn stiction_above_full_drive_never_moves() {
        let mut train = SimulatedTrain::new(30.0, 0.02);
        train.noise_cm = 0.0;
        train.stiction = 400;
        train.set_motor(DRIVE_MAX, Direction::Forward);
        for _ in 0..10 {
            assert_eq!(train.read_distance(), 30.0);
        }
    }

    #[test]
    fn forward_closes_and_reverse_opens_distance() {
        let mut train = SimulatedTrain::new(30.0, 0.02);
        train.noise_cm = 0.0;
        train.set_motor(DRIVE_MAX, Direction::Forward);
        let closer = train.read_distance();
        assert!(closer < 30.0);

        train.set_motor(DRIVE_MAX, Direction::Reverse);
        train.read_distance();
        let farther = train.read_distance();
        assert!(farther > closer);
    }

    #[test]
    fn scripted_hal_follows_motor_command() {
        let mut hal = ScriptedHal::new(|drive, _| if drive > 100 { 10.0 } else { 20.0 });
        assert_eq!(hal.read_distance(), 20.0);
        hal.set_motor(150, Direction::Forward);
        assert_eq!(hal.read_distance(), 10.0);
        assert_eq!(hal.motor_log, vec![(150, Direction::Forward)]);
    }
}
