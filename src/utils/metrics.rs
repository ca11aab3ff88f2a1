//! Per-instance counters kept by the host pipeline.
//!
//! Updated under the instance lock by the receiver (packets, malformed) and the
//! router consumer (written, dropped). Recent inputs are bounded to
//! `MAX_POINTS` for the status view.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::device::params::ExperimentMode;
use crate::telemetry::TelemetrySample;

pub const MAX_POINTS: usize = 1_000;
/// No packet for this long means the link is considered lost.
pub const STALE_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Nothing received yet.
    Waiting,
    Connected,
    Lost,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Waiting => "waiting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Lost => "connection lost",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct InstanceStats {
    /// Datagrams that parsed into a sample.
    pub packets: u64,
    pub malformed: u64,
    /// Samples dropped on router queue overflow.
    pub dropped: u64,
    /// Samples appended to a log sink.
    pub written: u64,
    pub pid_samples: u64,
    pub step_samples: u64,
    pub deadband_samples: u64,
    pub first_packet: Option<Instant>,
    pub last_packet: Option<Instant>,
    /// Recent measured inputs (distance or position).
    pub inputs: VecDeque<f64>,
}

impl InstanceStats {
    pub fn record_packet(&mut self, sample: &TelemetrySample, now: Instant) {
        self.packets += 1;
        self.first_packet.get_or_insert(now);
        self.last_packet = Some(now);
        let input = match sample {
            TelemetrySample::Pid(s) => {
                self.pid_samples += 1;
                s.input
            }
            TelemetrySample::Step(s) => {
                self.step_samples += 1;
                s.input
            }
            TelemetrySample::Deadband(s) => {
                self.deadband_samples += 1;
                s.position
            }
        };
        push_capped(&mut self.inputs, input);
    }

    pub fn samples_for(&self, mode: ExperimentMode) -> u64 {
        match mode {
            ExperimentMode::Pid => self.pid_samples,
            ExperimentMode::Step => self.step_samples,
            ExperimentMode::Deadband => self.deadband_samples,
            ExperimentMode::Idle => 0,
        }
    }

    pub fn connection_status(&self, now: Instant) -> ConnectionStatus {
        match self.last_packet {
            None => ConnectionStatus::Waiting,
            Some(t) if now.saturating_duration_since(t) > STALE_AFTER => ConnectionStatus::Lost,
            Some(_) => ConnectionStatus::Connected,
        }
    }

    /// Packets per second between the first and last packet.
    pub fn packet_rate(&self) -> f64 {
        match (self.first_packet, self.last_packet) {
            (Some(first), Some(last)) if last > first => {
                (self.packets.saturating_sub(1)) as f64 / (last - first).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

/// Appends value to a bounded buffer; drops the oldest at capacity.
#[inline]
pub fn push_capped(buf: &mut VecDeque<f64>, val: f64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

pub fn calculate_stats(data: &VecDeque<f64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}
