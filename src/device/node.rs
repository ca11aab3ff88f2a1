//! node.rs
//! The device main loop: channel service, pending commands, one control tick.
//!
//! Single threaded. Channel messages are only decoded into pending commands while
//! servicing the channel; the commands are applied right before the next control
//! tick, never from inside a callback. A lost broker session is re-opened with
//! bounded backoff counted in ticks, so the control loop keeps its period.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::channel::backoff::Backoff;
use crate::channel::bus::{ChannelConnection, Connector, Message};
use crate::channel::topic::{TopicKind, TopicSpace, flag, parse_flag};
use crate::device::control::DriveCommand;
use crate::device::emitter::{DatagramSink, TelemetryEmitter};
use crate::device::hal::Hal;
use crate::device::params::{Direction, ExperimentMode, ParameterSet};
use crate::device::state::{Announcement, DeviceCommand, ExperimentMachine};

/// Upper bound on channel messages taken per tick.
const MAX_MESSAGES_PER_TICK: usize = 64;

/// Decode a channel message addressed to this device.
pub fn decode_command(topics: &TopicSpace, msg: &Message) -> Option<DeviceCommand> {
    match topics.parse(&msg.topic)? {
        TopicKind::Command(key) => match msg.payload.trim().parse::<f64>() {
            Ok(v) => Some(DeviceCommand::SetParam(key, v)),
            Err(_) => {
                warn!("ignoring non-numeric value {:?} on {}", msg.payload, msg.topic);
                None
            }
        },
        TopicKind::Sync(mode) => Some(if parse_flag(&msg.payload)? {
            DeviceCommand::Start(mode)
        } else {
            DeviceCommand::Stop(mode)
        }),
        TopicKind::RequestParams(mode) => Some(DeviceCommand::RequestParams(mode)),
        TopicKind::DeadbandApply => Some(DeviceCommand::ApplyDeadband),
        _ => None,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub ticks: u64,
    pub deadline_misses: u64,
    pub reconnects: u64,
    pub published: u64,
    pub unpublished: u64,
}

pub struct Device<C: Connector, H: Hal, S: DatagramSink> {
    name: String,
    topics: TopicSpace,
    connector: C,
    conn: Option<C::Connection>,
    backoff: Backoff,
    retry_at_tick: u64,
    hal: H,
    emitter: TelemetryEmitter<S>,
    machine: ExperimentMachine,
    pending: VecDeque<DeviceCommand>,
    last_command: DriveCommand,
    stats: DeviceStats,
}

impl<C: Connector, H: Hal, S: DatagramSink> Device<C, H, S> {
    pub fn new(name: &str, prefix: &str, connector: C, hal: H, sink: S, params: ParameterSet) -> Self {
        Self {
            name: name.to_string(),
            topics: TopicSpace::new(prefix),
            connector,
            conn: None,
            backoff: Backoff::default(),
            retry_at_tick: 0,
            hal,
            emitter: TelemetryEmitter::new(sink),
            machine: ExperimentMachine::new(params),
            pending: VecDeque::new(),
            last_command: DriveCommand::off(Direction::Forward),
            stats: DeviceStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExperimentMode {
        self.machine.mode()
    }

    pub fn machine(&self) -> &ExperimentMachine {
        &self.machine
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn emitter(&self) -> &TelemetryEmitter<S> {
        &self.emitter
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.machine.period_ms())
    }

    fn try_connect(&mut self) {
        let attempt = self.connector.connect().and_then(|mut conn| {
            for topic in self.topics.device_subscriptions() {
                conn.subscribe(&topic)?;
            }
            Ok(conn)
        });
        match attempt {
            Ok(conn) => {
                info!("[{}] channel connected", self.name);
                self.conn = Some(conn);
                self.backoff.reset();
                self.stats.reconnects += 1;
            }
            Err(e) => {
                let delay = self.backoff.next_delay();
                let period_ms = self.machine.period_ms().max(1) as u128;
                let ticks = (delay.as_millis() / period_ms).max(1) as u64;
                self.retry_at_tick = self.stats.ticks + ticks;
                debug!("[{}] connect failed ({}), retry in {:?}", self.name, e, delay);
            }
        }
    }

    /// Pull waiting messages into the pending command queue.
    fn service_channel(&mut self) {
        if self.conn.is_none() && self.stats.ticks >= self.retry_at_tick {
            self.try_connect();
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        for _ in 0..MAX_MESSAGES_PER_TICK {
            match conn.poll(Duration::ZERO) {
                Ok(Some(msg)) => {
                    if let Some(cmd) = decode_command(&self.topics, &msg) {
                        self.pending.push_back(cmd);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] channel lost: {}", self.name, e);
                    self.conn = None;
                    self.retry_at_tick = self.stats.ticks + 1;
                    break;
                }
            }
        }
    }

    fn publish(&mut self, topic: String, payload: String) {
        let ok = match self.conn.as_mut() {
            Some(conn) => conn.publish(&topic, &payload).is_ok(),
            None => false,
        };
        if ok {
            self.stats.published += 1;
        } else {
            self.stats.unpublished += 1;
            debug!("[{}] not published (offline): {}", self.name, topic);
        }
    }

    fn announce(&mut self, announcements: Vec<Announcement>) {
        for a in announcements {
            let (topic, payload) = match a {
                Announcement::Confirm { key, value } => (self.topics.status(key), value.to_string()),
                Announcement::Activation { mode, active } => {
                    (self.topics.sync_status(mode), flag(active).to_string())
                }
                Announcement::CalibrationDone(result) => {
                    let payload = serde_json::to_string(&result).unwrap_or_else(|_| result.drive.to_string());
                    (self.topics.deadband_result(), payload)
                }
                Announcement::CalibrationFailed(reason) => (self.topics.deadband_error(), reason),
                Announcement::DeadbandApplied(value) => (self.topics.deadband_applied(), value.to_string()),
            };
            self.publish(topic, payload);
        }
    }

    /// One full period: channel, pending commands, control tick.
    pub fn step(&mut self) {
        self.service_channel();

        while let Some(cmd) = self.pending.pop_front() {
            let out = self.machine.handle(cmd);
            self.announce(out);
        }

        let distance = self.hal.read_distance();
        let supply = self.hal.read_supply_voltage();
        let out = self.machine.tick(distance, supply);

        // sample first: a deadband detection must be on the wire before the motor stops
        if let Some(sample) = &out.sample {
            self.emitter.emit(sample);
        }
        self.hal.set_motor(out.command.drive, out.command.direction);
        self.last_command = out.command;
        self.announce(out.announcements);
        self.stats.ticks += 1;
    }

    /// Periodic loop until `running` is cleared. The motor is switched off on exit.
    pub fn run(&mut self, running: Arc<AtomicBool>) {
        let period = self.period();
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
        let mut next_deadline = Instant::now() + period;

        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next_deadline {
                sleeper.sleep(next_deadline - now);
            } else {
                self.stats.deadline_misses += 1;
            }

            self.step();
            next_deadline += period;
        }

        self.hal.set_motor(0, self.last_command.direction);
        info!(
            "[{}] stopped after {} ticks ({} late, {} telemetry sent)",
            self.name,
            self.stats.ticks,
            self.stats.deadline_misses,
            self.emitter.sent()
        );
    }
}
